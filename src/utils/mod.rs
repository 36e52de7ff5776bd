pub mod archive;
pub mod command;
pub mod docker;
pub mod locker;
pub mod portainer;

// Trait-based abstractions for testability
pub mod executor;
pub mod docker_ops;

// Re-export commonly used types and traits (used by test crate)
#[allow(unused_imports)]
pub use executor::{CommandExecutor, RealExecutor};
#[allow(unused_imports)]
pub use docker_ops::{ContainerRuntime, DockerCli};
#[allow(unused_imports)]
pub use portainer::{PortainerClient, StackApi};
