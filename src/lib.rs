pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod executorapi;
pub mod jobdb;
pub mod leader;
pub mod publisher;
pub mod repository;
pub mod scheduler;
pub mod shutdown;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("flotilla");
}
