//! Legacy weight stream: the root pushes per-op tensor chunks to each
//! worker as `{u32 nameLen, name, u32 opIndex, u64 offset, u64 nBytes,
//! payload}` tuples, terminated by a zero-length name. The worker ACKs
//! the sentinel.

use byteorder::{ByteOrder, LittleEndian};

use latticelm_core::graph::WeightSink;

use crate::error::Result;
use crate::socket::{Network, ROOT_SOCKET_INDEX};

/// Root side: sends one weight chunk to a worker.
pub fn write_weight_chunk(
    network: &Network,
    socket_index: usize,
    op_name: &str,
    op_index: u32,
    offset: u64,
    payload: &[u8],
) -> Result<()> {
    let name = op_name.as_bytes();
    let mut header = [0u8; 4];
    LittleEndian::write_u32(&mut header, name.len() as u32);
    network.write(socket_index, &header)?;
    network.write(socket_index, name)?;
    LittleEndian::write_u32(&mut header, op_index);
    network.write(socket_index, &header)?;
    let mut wide = [0u8; 8];
    LittleEndian::write_u64(&mut wide, offset);
    network.write(socket_index, &wide)?;
    LittleEndian::write_u64(&mut wide, payload.len() as u64);
    network.write(socket_index, &wide)?;
    network.write(socket_index, payload)?;
    Ok(())
}

/// Root side: terminates the stream for one worker and waits for its
/// ACK.
pub fn finish_weight_stream(network: &Network, socket_index: usize) -> Result<()> {
    network.write(socket_index, &0u32.to_le_bytes())?;
    network.read_ack(socket_index)?;
    Ok(())
}

/// Worker side: consumes the stream from the root, feeding every chunk
/// into the sink, until the sentinel arrives.
pub fn read_weight_stream(network: &Network, sink: &mut dyn WeightSink) -> Result<()> {
    let mut scratch = Vec::new();
    loop {
        let mut word = [0u8; 4];
        network.read(ROOT_SOCKET_INDEX, &mut word)?;
        let name_len = LittleEndian::read_u32(&word) as usize;
        if name_len == 0 {
            network.write_ack(ROOT_SOCKET_INDEX)?;
            tracing::info!("weights loaded");
            return Ok(());
        }
        let mut name_buf = vec![0u8; name_len];
        network.read(ROOT_SOCKET_INDEX, &mut name_buf)?;
        let name = String::from_utf8_lossy(&name_buf).into_owned();

        network.read(ROOT_SOCKET_INDEX, &mut word)?;
        let op_index = LittleEndian::read_u32(&word);
        let mut wide = [0u8; 8];
        network.read(ROOT_SOCKET_INDEX, &mut wide)?;
        let offset = LittleEndian::read_u64(&wide) as usize;
        network.read(ROOT_SOCKET_INDEX, &mut wide)?;
        let n_bytes = LittleEndian::read_u64(&wide) as usize;

        scratch.resize(n_bytes, 0);
        network.read(ROOT_SOCKET_INDEX, &mut scratch)?;
        sink.upload(&name, op_index, offset, &scratch);
        tracing::debug!(op = %name, op_index, kib = n_bytes / 1024, "loaded weight chunk");
    }
}
