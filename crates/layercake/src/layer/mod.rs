//! Layers: records, definition files, the registry and the state probe.

pub mod definition;
pub mod info;
pub mod probe;
pub mod registry;

pub use definition::{LayerDefinition, MountKind, MountSpec, ParseMode};
pub use info::{BaseError, InUse, InUseMap, LayerInfo, LayerState};
pub use probe::{LayerStateProbe, MountSource, RequiredMount, required_mounts};
pub use registry::{LayerRegistry, parse_layers_file};
