//! Fixed-layout control packets. All integers little-endian.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{NetError, Result};
use crate::socket::Network;

/// `ControlPacket.flags` bit 0: request per-forward profiling packets.
pub const CONTROL_PROFILE: u32 = 1 << 0;

/// The 12-byte per-forward control packet the root broadcasts.
/// `batch_size == 0` is the terminal stop packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlPacket {
    pub position: u32,
    pub batch_size: u32,
    pub flags: u32,
}

impl ControlPacket {
    pub const WIRE_SIZE: usize = 12;

    pub fn stop() -> Self {
        ControlPacket::default()
    }

    pub fn is_stop(&self) -> bool {
        self.batch_size == 0
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.position);
        LittleEndian::write_u32(&mut buf[4..8], self.batch_size);
        LittleEndian::write_u32(&mut buf[8..12], self.flags);
        buf
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        ControlPacket {
            position: LittleEndian::read_u32(&buf[0..4]),
            batch_size: LittleEndian::read_u32(&buf[4..8]),
            flags: LittleEndian::read_u32(&buf[8..12]),
        }
    }
}

/// The 24-byte per-forward profiling reply. Times are microseconds
/// accumulated within the forward that just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerfPacket {
    pub position: u32,
    pub batch_size: u32,
    pub node_index: u32,
    pub stage_index: u32,
    pub exec_us: u32,
    pub sync_us: u32,
}

impl PerfPacket {
    pub const WIRE_SIZE: usize = 24;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.position);
        LittleEndian::write_u32(&mut buf[4..8], self.batch_size);
        LittleEndian::write_u32(&mut buf[8..12], self.node_index);
        LittleEndian::write_u32(&mut buf[12..16], self.stage_index);
        LittleEndian::write_u32(&mut buf[16..20], self.exec_us);
        LittleEndian::write_u32(&mut buf[20..24], self.sync_us);
        buf
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        PerfPacket {
            position: LittleEndian::read_u32(&buf[0..4]),
            batch_size: LittleEndian::read_u32(&buf[4..8]),
            node_index: LittleEndian::read_u32(&buf[8..12]),
            stage_index: LittleEndian::read_u32(&buf[12..16]),
            exec_us: LittleEndian::read_u32(&buf[16..20]),
            sync_us: LittleEndian::read_u32(&buf[20..24]),
        }
    }
}

pub const BOOTSTRAP_MAGIC: u32 = 0x4D42_4C44; // 'DLBM'
pub const BOOTSTRAP_VERSION: u32 = 2;
pub const BOOTSTRAP_HAS_MODEL_PATH: u32 = 1 << 0;
pub const BOOTSTRAP_HAS_RATIOS: u32 = 1 << 1;

/// Session configuration the root pushes to each worker right after
/// mesh-up: a fixed 32-byte header followed by two optional
/// NUL-terminated strings, so workers need no `--model`/`--ratios` of
/// their own.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootstrapPacket {
    pub benchmark_enabled: bool,
    pub max_seq_len: u32,
    pub sync_type: u32,
    pub model_path: Option<String>,
    pub ratios: Option<String>,
}

impl BootstrapPacket {
    pub const HEADER_SIZE: usize = 32;

    pub fn write_to(&self, network: &Network, socket_index: usize) -> Result<()> {
        let mut flags = 0u32;
        let model_path_len = self.model_path.as_ref().map_or(0, |s| s.len() as u32 + 1);
        let ratios_len = self.ratios.as_ref().map_or(0, |s| s.len() as u32 + 1);
        if model_path_len > 0 {
            flags |= BOOTSTRAP_HAS_MODEL_PATH;
        }
        if ratios_len > 0 {
            flags |= BOOTSTRAP_HAS_RATIOS;
        }

        let mut header = [0u8; Self::HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], BOOTSTRAP_MAGIC);
        LittleEndian::write_u32(&mut header[4..8], BOOTSTRAP_VERSION);
        LittleEndian::write_u32(&mut header[8..12], flags);
        LittleEndian::write_u32(&mut header[12..16], u32::from(self.benchmark_enabled));
        LittleEndian::write_u32(&mut header[16..20], self.max_seq_len);
        LittleEndian::write_u32(&mut header[20..24], self.sync_type);
        LittleEndian::write_u32(&mut header[24..28], model_path_len);
        LittleEndian::write_u32(&mut header[28..32], ratios_len);
        network.write(socket_index, &header)?;

        if let Some(path) = &self.model_path {
            network.write(socket_index, path.as_bytes())?;
            network.write(socket_index, &[0u8])?;
        }
        if let Some(ratios) = &self.ratios {
            network.write(socket_index, ratios.as_bytes())?;
            network.write(socket_index, &[0u8])?;
        }
        Ok(())
    }

    pub fn read_from(network: &Network, socket_index: usize) -> Result<Self> {
        let mut header = [0u8; Self::HEADER_SIZE];
        network.read(socket_index, &mut header)?;
        if LittleEndian::read_u32(&header[0..4]) != BOOTSTRAP_MAGIC {
            return Err(NetError::BadBootstrapMagic);
        }
        let version = LittleEndian::read_u32(&header[4..8]);
        if version != BOOTSTRAP_VERSION {
            return Err(NetError::BadBootstrapVersion(version));
        }
        let flags = LittleEndian::read_u32(&header[8..12]);
        let benchmark_enabled = LittleEndian::read_u32(&header[12..16]) != 0;
        let max_seq_len = LittleEndian::read_u32(&header[16..20]);
        let sync_type = LittleEndian::read_u32(&header[20..24]);
        let model_path_len = LittleEndian::read_u32(&header[24..28]) as usize;
        let ratios_len = LittleEndian::read_u32(&header[28..32]) as usize;

        let read_string = |len: usize| -> Result<Option<String>> {
            if len == 0 {
                return Ok(None);
            }
            let mut buf = vec![0u8; len];
            network.read(socket_index, &mut buf)?;
            buf.pop(); // trailing NUL
            String::from_utf8(buf)
                .map(Some)
                .map_err(|_| NetError::ConfigDecode("bootstrap string is not utf-8".into()))
        };

        let model_path = if flags & BOOTSTRAP_HAS_MODEL_PATH != 0 {
            read_string(model_path_len)?
        } else {
            None
        };
        let ratios = if flags & BOOTSTRAP_HAS_RATIOS != 0 {
            read_string(ratios_len)?
        } else {
            None
        };

        Ok(BootstrapPacket {
            benchmark_enabled,
            max_seq_len,
            sync_type,
            model_path,
            ratios,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_packet_roundtrip() {
        let packet = ControlPacket {
            position: 17,
            batch_size: 4,
            flags: CONTROL_PROFILE,
        };
        assert_eq!(ControlPacket::decode(&packet.encode()), packet);
        assert!(!packet.is_stop());
        assert!(ControlPacket::stop().is_stop());
    }

    #[test]
    fn test_perf_packet_roundtrip() {
        let packet = PerfPacket {
            position: 9,
            batch_size: 1,
            node_index: 2,
            stage_index: 1,
            exec_us: 1234,
            sync_us: 567,
        };
        assert_eq!(PerfPacket::decode(&packet.encode()), packet);
    }
}
