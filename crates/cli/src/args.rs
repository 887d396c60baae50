//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "latticelm")]
#[command(version)]
#[command(about = "Distributed LLM inference with tensor and pipeline parallelism")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate tokens from a prompt
    Inference(InferenceArgs),
    /// Interactive chat session
    Chat(InferenceArgs),
    /// Perplexity of the prompt under the model
    Perplexity(InferenceArgs),
    /// Serve as a worker node
    Worker(WorkerArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChatTemplateKind {
    Llama2,
    Llama3,
    #[value(name = "deepSeek3")]
    DeepSeek3,
}

fn parse_bool01(value: &str) -> Result<bool, String> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(format!("expected 0 or 1, got {other}")),
    }
}

#[derive(Args, Debug)]
pub struct InferenceArgs {
    /// Memory-mapped model file
    #[arg(long)]
    pub model: PathBuf,

    /// Tokenizer vocabulary file
    #[arg(long)]
    pub tokenizer: PathBuf,

    #[arg(long)]
    pub prompt: Option<String>,

    /// Tokens to generate (prompt included)
    #[arg(long, default_value_t = 0)]
    pub steps: u32,

    /// 0 selects greedy decoding
    #[arg(long, default_value_t = 0.8)]
    pub temperature: f32,

    #[arg(long, default_value_t = 0.9)]
    pub topp: f32,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long = "chat-template", value_enum)]
    pub chat_template: Option<ChatTemplateKind>,

    /// Cap the model's sequence length (0 keeps the model value)
    #[arg(long = "max-seq-len", default_value_t = 0)]
    pub max_seq_len: u32,

    /// Mesh peers as host:port, variadic
    #[arg(long, num_args = 1..)]
    pub workers: Vec<String>,

    #[arg(long, default_value_t = 1)]
    pub nthreads: u32,

    /// Dtype of inter-node transfer buffers
    #[arg(long = "buffer-float-type", default_value = "f32")]
    pub buffer_float_type: String,

    /// Cluster topology; absent means a uniform partition
    #[arg(long)]
    pub ratios: Option<String>,

    #[arg(long = "net-turbo", value_parser = parse_bool01, num_args = 1, default_value = "1")]
    pub net_turbo: bool,

    /// Emit per-forward profile packets
    #[arg(long, value_parser = parse_bool01, num_args = 0..=1, default_value = "0", default_missing_value = "1")]
    pub benchmark: bool,

    /// Maximum batch rows per forward during prompt evaluation
    #[arg(long, default_value_t = 32)]
    pub nbatches: u32,

    #[arg(long = "gpu-index", default_value_t = -1)]
    pub gpu_index: i32,

    /// GPU segment range as FROM:TO
    #[arg(long = "gpu-segments")]
    pub gpu_segments: Option<String>,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long, default_value_t = 9990)]
    pub port: u16,

    #[arg(long, default_value_t = 1)]
    pub nthreads: u32,

    #[arg(long = "net-turbo", value_parser = parse_bool01, num_args = 1, default_value = "1")]
    pub net_turbo: bool,

    #[arg(long = "gpu-index", default_value_t = -1)]
    pub gpu_index: i32,
}

impl InferenceArgs {
    /// Parses `--workers` entries into `(host, port)` pairs.
    pub fn worker_addrs(&self) -> anyhow::Result<Vec<(String, u16)>> {
        self.workers
            .iter()
            .map(|entry| {
                let (host, port) = entry
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow::anyhow!("Invalid worker address: {entry}"))?;
                Ok((host.to_string(), port.parse()?))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_args_parse() {
        let cli = Cli::parse_from([
            "latticelm",
            "inference",
            "--model",
            "model.bin",
            "--tokenizer",
            "tok.bin",
            "--prompt",
            "hello",
            "--steps",
            "16",
            "--workers",
            "10.0.0.1:9990",
            "10.0.0.2:9991",
            "--ratios",
            "1,1*1,1",
            "--buffer-float-type",
            "q80",
            "--benchmark",
        ]);
        let Command::Inference(args) = cli.command else {
            panic!("expected inference mode");
        };
        assert_eq!(args.steps, 16);
        assert_eq!(
            args.worker_addrs().unwrap(),
            vec![("10.0.0.1".into(), 9990), ("10.0.0.2".into(), 9991)]
        );
        assert!(args.benchmark);
        assert!(args.net_turbo);
    }

    #[test]
    fn test_worker_defaults() {
        let cli = Cli::parse_from(["latticelm", "worker"]);
        let Command::Worker(args) = cli.command else {
            panic!("expected worker mode");
        };
        assert_eq!(args.port, 9990);
        assert_eq!(args.nthreads, 1);
    }

    #[test]
    fn test_benchmark_accepts_value() {
        let cli = Cli::parse_from([
            "latticelm",
            "worker",
            "--net-turbo",
            "0",
        ]);
        let Command::Worker(args) = cli.command else {
            panic!()
        };
        assert!(!args.net_turbo);
    }
}
