pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
