// Domain layer: core models and ports (interfaces) for the collaborators the pipeline drives.

pub mod model;
pub mod ports;
