//! Sandbox backends.

mod docker;

pub use docker::DockerProvider;
