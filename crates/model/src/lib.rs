//! Model layer: decodes the model file header, builds the per-node
//! dataflow graphs for a transformer, and streams weights into the
//! executor either from a local memory map or over the legacy
//! root-distributor wire.

pub mod error;
pub mod header;
pub mod loader;
pub mod mmap;
pub mod net_builder;

pub use error::{ModelError, Result};
pub use header::{ArchType, HiddenAct, ModelHeader, MODEL_MAGIC};
pub use loader::{LoadScope, LocalWeightLoader, RootWeightDistributor, WeightLoader};
pub use mmap::ModelFile;
pub use net_builder::{build_llm_net, LlmNet};
