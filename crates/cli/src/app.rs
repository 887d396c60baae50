//! Root and worker application loops.
//!
//! The root builds the plan and graph, brings up the mesh, bootstraps
//! the workers, pushes their node graphs, loads weights, and then
//! drives forwards with control packets. Workers serve forever: each
//! accepted session reads its bootstrap + configs + weights and loops
//! on control packets until the stop packet or a transfer error sends
//! it back to `accept`.

use std::io::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};

use latticelm_core::graph::Synchronizer;
use latticelm_core::plan::PartitionPlan;
use latticelm_core::topology::parse_stage_defs;
use latticelm_core::FloatType;
use latticelm_model::loader::{load_model_weights, LoadScope, LocalWeightLoader, RootWeightDistributor};
use latticelm_model::{build_llm_net, LlmNet, ModelFile, ModelHeader};
use latticelm_net::config_wire::{
    decode_net_config, decode_node_config, decode_plan, encode_net_config, encode_node_config,
    encode_plan, pull_config, push_config,
};
use latticelm_net::socket::{ReadIo, ROOT_SOCKET_INDEX};
use latticelm_net::weight_wire::read_weight_stream;
use latticelm_net::{BootstrapPacket, ControlPacket, Network, PerfPacket, CONTROL_PROFILE};
use latticelm_runtime::{Executor, FakeSynchronizer, StepKind};
use latticelm_net::NetworkSynchronizer;

use crate::args::{InferenceArgs, WorkerArgs};
use crate::chat::{ChatItem, ChatTemplate, EosDetector, EosKind};
use crate::sampler::{softmax, Sampler};
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Inference,
    Chat,
    Perplexity,
}

/// Root-side handle over one inference session.
pub struct RootInference {
    executor: Executor,
    network: Option<Arc<Network>>,
    plan: Arc<PartitionPlan>,
    control: ControlPacket,
    position_pipe: u32,
    token_pipe: u32,
    logits_pipe: u32,
    seq_len: u32,
    vocab_size: u32,
    profile: bool,
    last_perf: Vec<PerfPacket>,
}

impl RootInference {
    pub fn set_batch_size(&mut self, batch_size: u32) {
        self.executor.set_batch_size(batch_size);
        self.control.batch_size = batch_size;
    }

    pub fn set_position(&mut self, position: u32) {
        assert!(position + self.control.batch_size <= self.seq_len);
        self.control.position = position;
        let batch = self.control.batch_size;
        let positions = self.executor.pipe_f32_mut(self.position_pipe);
        for i in 0..batch {
            positions[i as usize] = (position + i) as f32;
        }
    }

    pub fn set_token(&mut self, batch_index: u32, token: u32) {
        assert!(batch_index < self.control.batch_size);
        self.executor.pipe_f32_mut(self.token_pipe)[batch_index as usize] = token as f32;
    }

    pub fn forward(&mut self) -> anyhow::Result<()> {
        if let Some(network) = &self.network {
            network.write_to_all(&self.control.encode())?;
        }
        self.executor.forward()?;
        if self.profile {
            self.collect_perf()?;
        }
        Ok(())
    }

    fn collect_perf(&mut self) -> anyhow::Result<()> {
        self.last_perf.clear();
        self.last_perf.push(PerfPacket {
            position: self.control.position,
            batch_size: self.control.batch_size,
            node_index: 0,
            stage_index: self.plan.stage_index_for_node(0),
            exec_us: self.executor.total_time(StepKind::ExecuteOp),
            sync_us: self.executor.total_time(StepKind::SyncNodes),
        });
        if let Some(network) = &self.network {
            let n_workers = network.n_sockets();
            let mut buffers = vec![[0u8; PerfPacket::WIRE_SIZE]; n_workers];
            {
                let mut ios: Vec<ReadIo<'_>> = buffers
                    .iter_mut()
                    .enumerate()
                    .map(|(socket_index, data)| ReadIo {
                        socket_index,
                        data: &mut data[..],
                    })
                    .collect();
                network.read_many(&mut ios)?;
            }
            for buffer in &buffers {
                self.last_perf.push(PerfPacket::decode(buffer));
            }
        }
        Ok(())
    }

    pub fn last_perf(&self) -> &[PerfPacket] {
        &self.last_perf
    }

    /// Logits of one batch row, populated after `forward`.
    pub fn logits(&self, batch_index: u32) -> &[f32] {
        let row = self.vocab_size as usize;
        &self.executor.pipe_f32(self.logits_pipe)[batch_index as usize * row..][..row]
    }

    pub fn exec_time_us(&self) -> u32 {
        self.executor.total_time(StepKind::ExecuteOp)
    }

    pub fn sync_time_us(&self) -> u32 {
        self.executor.total_time(StepKind::SyncNodes)
    }

    /// Sends the terminal stop packet; safe to call more than once.
    pub fn finish(&mut self) {
        if let Some(network) = &self.network {
            let stop = ControlPacket::stop();
            if let Err(e) = network.write_to_all(&stop.encode()) {
                tracing::warn!("failed to send stop packet: {e}");
            }
        }
    }
}

fn build_plan(
    ratios: Option<&str>,
    n_nodes: u32,
    header: &ModelHeader,
) -> anyhow::Result<PartitionPlan> {
    let plan = match ratios {
        Some(ratios) => {
            let defs = parse_stage_defs(ratios, n_nodes, header.n_layers)?;
            PartitionPlan::new(&defs, header.dims())?
        }
        None => PartitionPlan::uniform(n_nodes, header.dims())?,
    };
    Ok(plan)
}

pub fn run_root(args: &InferenceArgs, mode: Mode) -> anyhow::Result<()> {
    if args.gpu_index >= 0 {
        bail!("This build does not support GPU");
    }
    let sync_type: FloatType = args.buffer_float_type.parse()?;
    let n_nodes = args.workers.len() as u32 + 1;

    let header = ModelHeader::load(&args.model, args.max_seq_len, sync_type)?;
    header.log_summary();

    let tokenizer = Tokenizer::load(&args.tokenizer)?;
    if tokenizer.vocab_size != header.vocab_size {
        tracing::warn!(
            tokenizer = tokenizer.vocab_size,
            model = header.vocab_size,
            "tokenizer vocab size does not match the model"
        );
    }

    let plan = Arc::new(build_plan(args.ratios.as_deref(), n_nodes, &header)?);
    if args.ratios.is_some() {
        tracing::info!(ratios = args.ratios.as_deref().unwrap(), "uneven partitioning enabled");
        for stage in &plan.stages {
            tracing::info!(
                stage = stage.stage_index,
                layers = ?(stage.start_layer..stage.end_layer),
                nodes = ?stage.node_indices,
                "stage layout"
            );
        }
    }

    let net: LlmNet = build_llm_net(&header, &plan, args.nbatches)?;
    tracing::info!(
        mib = net.node_configs[0].required_memory(&net.net_config) / (1024 * 1024),
        "root required memory"
    );

    let network = if n_nodes > 1 {
        Some(Arc::new(Network::connect(&args.worker_addrs()?)?))
    } else {
        None
    };

    if let Some(network) = &network {
        // Bootstrap every worker so it can plan and load by itself.
        let packet = BootstrapPacket {
            benchmark_enabled: args.benchmark,
            max_seq_len: args.max_seq_len,
            sync_type: sync_type.to_wire(),
            model_path: args.ratios.as_ref().map(|_| {
                args.model.to_string_lossy().into_owned()
            }),
            ratios: args.ratios.clone(),
        };
        for socket_index in 0..network.n_sockets() {
            packet.write_to(network, socket_index)?;
        }

        let net_payload = encode_net_config(&net.net_config);
        let plan_payload = encode_plan(&plan);
        for (socket_index, node_config) in net.node_configs.iter().skip(1).enumerate() {
            push_config(network, socket_index, &net_payload)?;
            push_config(network, socket_index, &plan_payload)?;
            push_config(network, socket_index, &encode_node_config(node_config))?;
        }
    }

    let synchronizer: Box<dyn Synchronizer> = match &network {
        Some(network) => Box::new(NetworkSynchronizer::new(
            Arc::clone(network),
            net.net_config.clone(),
            &net.node_configs[0],
            Some(Arc::clone(&plan)),
        )),
        None => Box::new(FakeSynchronizer),
    };

    let mut executor = Executor::new(
        &net.net_config,
        &net.node_configs[0],
        Some(&plan),
        args.nthreads,
        synchronizer,
        args.benchmark,
    )?;

    // Weight distribution: local mmap loading whenever a non-trivial
    // partition plan is in use (workers were bootstrapped with the
    // model path), legacy root push otherwise.
    let file = ModelFile::open(&args.model)?;
    if args.ratios.is_some() || network.is_none() {
        let mut loader = LocalWeightLoader::new(0, &mut executor);
        load_model_weights(&file, &header, &plan, LoadScope::Node(0), &mut loader)?;
    } else {
        let mut distributor =
            RootWeightDistributor::new(network.as_deref(), n_nodes, &mut executor);
        load_model_weights(&file, &header, &plan, LoadScope::AllNodes, &mut distributor)?;
    }

    if let Some(network) = &network {
        network.take_stats();
        if args.net_turbo {
            network.set_turbo(true)?;
            tracing::info!("network is in non-blocking mode");
        }
    }

    let mut inference = RootInference {
        executor,
        network: network.clone(),
        plan: Arc::clone(&plan),
        control: ControlPacket {
            position: 0,
            batch_size: 1,
            flags: if args.benchmark { CONTROL_PROFILE } else { 0 },
        },
        position_pipe: net.position_pipe,
        token_pipe: net.token_pipe,
        logits_pipe: net.logits_pipe,
        seq_len: header.seq_len,
        vocab_size: header.vocab_size,
        profile: args.benchmark,
        last_perf: Vec::new(),
    };

    let mut sampler = Sampler::new(
        args.temperature,
        args.topp,
        args.seed.unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        }),
    );
    let mut tokenizer = tokenizer;

    let result = match mode {
        Mode::Inference => run_generation(args, &header, &mut inference, &mut tokenizer, &mut sampler),
        Mode::Perplexity => run_perplexity(args, &mut inference, &mut tokenizer),
        Mode::Chat => run_chat(args, &header, &mut inference, &mut tokenizer, &mut sampler),
    };

    inference.finish();
    result
}

fn run_generation(
    args: &InferenceArgs,
    header: &ModelHeader,
    inference: &mut RootInference,
    tokenizer: &mut Tokenizer,
    sampler: &mut Sampler,
) -> anyhow::Result<()> {
    let prompt = args.prompt.as_deref().context("Prompt is required")?;
    if args.steps == 0 {
        bail!("Number of steps is required");
    }
    let input_tokens = tokenizer.encode(prompt, true, false);
    let n_input = input_tokens.len() as u32;
    if n_input > header.seq_len {
        bail!("The number of prompt tokens is greater than the sequence length");
    }
    if n_input > args.steps {
        bail!("The number of prompt tokens is greater than the number of steps");
    }

    println!("{prompt}");
    let mut pos = 0u32;
    let mut eval_total_us = 0u64;
    let mut perf = PerfAggregator::new(args.benchmark);

    // Prompt evaluation: everything except the last token, batched.
    while n_input - 1 > pos {
        let batch = (n_input - 1 - pos).min(args.nbatches);
        inference.set_batch_size(batch);
        inference.set_position(pos);
        for i in 0..batch {
            inference.set_token(i, input_tokens[(pos + i) as usize]);
        }
        inference.forward()?;
        perf.absorb(inference.last_perf());
        pos += batch;

        let (exec, sync) = (inference.exec_time_us(), inference.sync_time_us());
        tracing::debug!(exec_ms = exec / 1000, sync_ms = sync / 1000, batch, "eval step");
        eval_total_us += (exec + sync) as u64;
    }

    // Generation starts from the last prompt token.
    let mut token = input_tokens[n_input as usize - 1];
    inference.set_batch_size(1);
    tokenizer.reset_decoder();

    let max_pos = header.seq_len.min(args.steps);
    let mut pred_total_us = 0u64;
    while pos < max_pos {
        inference.set_position(pos);
        inference.set_token(0, token);
        inference.forward()?;
        perf.absorb(inference.last_perf());

        token = sampler.sample(inference.logits(0));
        let piece = tokenizer.decode(token);
        print!("{piece}");
        std::io::stdout().flush().ok();

        pred_total_us += (inference.exec_time_us() + inference.sync_time_us()) as u64;
        pos += 1;
    }
    println!();

    let n_eval = n_input - 1;
    let n_pred = pos - n_eval;
    let eval_ms = eval_total_us as f64 / 1000.0;
    let pred_ms = pred_total_us as f64 / 1000.0;
    println!();
    println!("Evaluation");
    println!("   nBatches: {}", args.nbatches);
    println!("    nTokens: {n_eval}");
    if eval_ms > 0.0 {
        println!(
            "   tokens/s: {:.2} ({:.2} ms/tok)",
            n_eval as f64 * 1000.0 / eval_ms,
            eval_ms / n_eval as f64
        );
    }
    println!("Prediction");
    println!("    nTokens: {n_pred}");
    if pred_ms > 0.0 && n_pred > 0 {
        println!(
            "   tokens/s: {:.2} ({:.2} ms/tok)",
            n_pred as f64 * 1000.0 / pred_ms,
            pred_ms / n_pred as f64
        );
    }
    perf.report();
    Ok(())
}

fn run_perplexity(
    args: &InferenceArgs,
    inference: &mut RootInference,
    tokenizer: &mut Tokenizer,
) -> anyhow::Result<()> {
    let prompt = args.prompt.as_deref().context("Prompt is required")?;
    let input_tokens = tokenizer.encode(prompt, true, false);
    let n_input = input_tokens.len();
    println!("Evaluating {n_input} tokens...");

    let mut total_log_prob = 0.0f64;
    inference.set_batch_size(1);
    for pos in 0..n_input - 1 {
        inference.set_position(pos as u32);
        inference.set_token(0, input_tokens[pos]);
        inference.forward()?;

        let mut probs = inference.logits(0).to_vec();
        softmax(&mut probs);
        let prob = probs[input_tokens[pos + 1] as usize].max(1e-30);
        total_log_prob += (prob as f64).ln();
    }

    let avg_log_prob = total_log_prob / (n_input - 1) as f64;
    let perplexity = (-avg_log_prob).exp();
    println!();
    println!("Results");
    println!("   perplexity: {perplexity:.6} (lower = better)");
    println!("   avgLogProb: {avg_log_prob:.6}");
    println!("   bitPerToken: {:.6}", -avg_log_prob / 2f64.ln());
    Ok(())
}

fn read_stdin(guide: &str) -> String {
    print!("{guide}");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok();
    line.trim_end_matches(['\n', '\r']).to_string()
}

fn run_chat(
    args: &InferenceArgs,
    header: &ModelHeader,
    inference: &mut RootInference,
    tokenizer: &mut Tokenizer,
    sampler: &mut Sampler,
) -> anyhow::Result<()> {
    let kind = args
        .chat_template
        .context("--chat-template is required for chat mode")?;
    let template = ChatTemplate::new(kind);
    let mut detector = EosDetector::new(vec![tokenizer.eos_id], template.stop_string());

    let system = read_stdin("System prompt (optional): ");
    let mut delta_items: Vec<ChatItem> = Vec::new();
    if !system.is_empty() {
        delta_items.push(ChatItem::new("system", &system));
    }

    let seq_len = header.seq_len;
    let mut pos = 0u32;
    loop {
        let user = loop {
            let line = read_stdin("\n> ");
            if !line.is_empty() {
                break line;
            }
        };
        delta_items.push(ChatItem::new("user", &user));

        let prompt = template.format(&delta_items, true);
        let input_tokens = tokenizer.encode(&prompt, pos == 0, false);
        let n_input = input_tokens.len() as u32;

        let prompt_end = seq_len.min(pos + n_input - 1);
        let mut consumed = 0u32;
        while prompt_end > pos {
            let batch = (prompt_end - pos).min(args.nbatches);
            inference.set_batch_size(batch);
            inference.set_position(pos);
            for i in 0..batch {
                inference.set_token(i, input_tokens[(consumed + i) as usize]);
            }
            inference.forward()?;
            consumed += batch;
            pos += batch;
        }

        let mut token = input_tokens[(consumed.min(n_input - 1)) as usize];
        inference.set_batch_size(1);
        tokenizer.reset_decoder();
        detector.reset();
        println!();

        while pos < seq_len {
            inference.set_position(pos);
            inference.set_token(0, token);
            inference.forward()?;
            token = sampler.sample(inference.logits(0));
            pos += 1;

            let piece = tokenizer.decode(token);
            let kind = detector.append(token, &piece);
            if let Some(delta) = detector.take_delta() {
                print!("{delta}");
                std::io::stdout().flush().ok();
            }
            if kind == EosKind::Eos {
                break;
            }
        }
        println!();

        delta_items.clear();
        if pos >= seq_len {
            break;
        }
    }
    println!("(end of context)");
    Ok(())
}

/// Per-node profile aggregation across forwards.
struct PerfAggregator {
    enabled: bool,
    per_node: Vec<(u32, u64, u64, u64, u64)>, // stage, exec, sync, forwards, tokens
}

impl PerfAggregator {
    fn new(enabled: bool) -> Self {
        PerfAggregator {
            enabled,
            per_node: Vec::new(),
        }
    }

    fn absorb(&mut self, packets: &[PerfPacket]) {
        if !self.enabled {
            return;
        }
        for packet in packets {
            let node = packet.node_index as usize;
            if self.per_node.len() <= node {
                self.per_node.resize(node + 1, (0, 0, 0, 0, 0));
            }
            let entry = &mut self.per_node[node];
            entry.0 = packet.stage_index;
            entry.1 += packet.exec_us as u64;
            entry.2 += packet.sync_us as u64;
            entry.3 += 1;
            entry.4 += packet.batch_size.max(1) as u64;
        }
    }

    fn report(&self) {
        if !self.enabled || self.per_node.is_empty() {
            return;
        }
        println!();
        println!("Stage/node profile");
        for (node, (stage, exec_us, sync_us, forwards, tokens)) in
            self.per_node.iter().enumerate()
        {
            if *forwards == 0 {
                continue;
            }
            let per_tok = (*exec_us + *sync_us) as f64 / 1000.0 / *tokens as f64;
            println!(
                "  stage {stage} node {node}: per-tok {per_tok:.2} ms (exec {:.2} sync {:.2}) over {forwards} forwards",
                *exec_us as f64 / 1000.0 / *tokens as f64,
                *sync_us as f64 / 1000.0 / *tokens as f64,
            );
        }
    }
}

pub fn run_worker(args: &WorkerArgs) -> anyhow::Result<()> {
    if args.gpu_index >= 0 {
        bail!("This build does not support GPU");
    }
    loop {
        if let Err(e) = serve_session(args) {
            tracing::warn!("session ended: {e}");
        }
    }
}

/// One worker session: mesh-up through control loop. Any error drops
/// the session; the caller loops back to `accept`.
fn serve_session(args: &WorkerArgs) -> anyhow::Result<()> {
    let network = Arc::new(Network::serve(args.port)?);
    let boot = BootstrapPacket::read_from(&network, ROOT_SOCKET_INDEX)?;

    let net_config = decode_net_config(&pull_config(&network, ROOT_SOCKET_INDEX)?)?;
    let plan = Arc::new(decode_plan(&pull_config(&network, ROOT_SOCKET_INDEX)?)?);
    let node_config = decode_node_config(&pull_config(&network, ROOT_SOCKET_INDEX)?)?;
    let node_index = node_config.node_index;
    tracing::info!(
        node_index,
        mib = node_config.required_memory(&net_config) / (1024 * 1024),
        "node configuration received"
    );

    // With a model path in the bootstrap the worker loads its shards
    // locally; otherwise the root streams the weights.
    let use_local_loading = boot.model_path.is_some();
    let mut local_header: Option<ModelHeader> = None;
    if use_local_loading {
        let model_path = std::path::PathBuf::from(boot.model_path.as_ref().unwrap());
        let mut sync_type = FloatType::from_wire(boot.sync_type)?;
        let mut header = ModelHeader::load(&model_path, boot.max_seq_len, sync_type)?;
        if header.weight_type == FloatType::Q40 && sync_type != FloatType::Q80 {
            sync_type = FloatType::Q80;
            header.sync_type = sync_type;
        }
        local_header = Some(header);
    }

    let synchronizer = NetworkSynchronizer::new(
        Arc::clone(&network),
        net_config.clone(),
        &node_config,
        Some(Arc::clone(&plan)),
    );
    let mut executor = Executor::new(
        &net_config,
        &node_config,
        Some(&plan),
        args.nthreads,
        Box::new(synchronizer),
        boot.benchmark_enabled,
    )?;

    if use_local_loading {
        let header = local_header.as_ref().unwrap();
        let model_path = std::path::PathBuf::from(boot.model_path.as_ref().unwrap());
        tracing::info!(node_index, path = %model_path.display(), "local loading mode");
        let file = ModelFile::open(&model_path)?;
        let mut loader = LocalWeightLoader::new(node_index, &mut executor);
        load_model_weights(&file, header, &plan, LoadScope::Node(node_index), &mut loader)?;
    } else {
        tracing::info!(node_index, "waiting for weights from the root");
        read_weight_stream(&network, &mut executor)?;
    }

    let position_pipe = net_config
        .pipes
        .iter()
        .position(|p| p.name == "POS")
        .unwrap_or(0) as u32;
    let stage_index = plan.stage_index_for_node(node_index);

    let mut is_turbo = false;
    let mut first_attempt = true;
    let mut idle_start = Instant::now();
    loop {
        if first_attempt {
            idle_start = Instant::now();
        }
        let mut buf = [0u8; ControlPacket::WIRE_SIZE];
        match network.try_read_with_max_attempts(ROOT_SOCKET_INDEX, &mut buf, 10_000) {
            Ok(true) => {}
            Ok(false) => {
                // Idle: fall back to blocking sockets to release CPU.
                if is_turbo && !first_attempt && idle_start.elapsed() > Duration::from_secs(1) {
                    network.set_turbo(false)?;
                    is_turbo = false;
                    tracing::info!("network is in blocking mode");
                }
                first_attempt = false;
                continue;
            }
            Err(e) => {
                tracing::warn!("network error: {e}");
                break;
            }
        }

        let control = ControlPacket::decode(&buf);
        if control.is_stop() {
            tracing::info!("stop packet received");
            break;
        }
        if args.net_turbo && !is_turbo {
            network.set_turbo(true)?;
            is_turbo = true;
            tracing::info!("network is in non-blocking mode");
        }

        executor.set_batch_size(control.batch_size);
        {
            let positions = executor.pipe_f32_mut(position_pipe);
            for i in 0..control.batch_size {
                positions[i as usize] = (control.position + i) as f32;
            }
        }

        if let Err(e) = executor.forward() {
            tracing::warn!("inference error: {e}");
            break;
        }

        // The root blocks on these replies whenever it requested
        // profiling, so answer even if this worker did not measure.
        if control.flags & CONTROL_PROFILE != 0 {
            let packet = PerfPacket {
                position: control.position,
                batch_size: control.batch_size,
                node_index,
                stage_index,
                exec_us: executor.total_time(StepKind::ExecuteOp),
                sync_us: executor.total_time(StepKind::SyncNodes),
            };
            network.write(ROOT_SOCKET_INDEX, &packet.encode())?;
        }
        first_attempt = true;
    }
    Ok(())
}
