pub mod base;
pub mod memunit;
pub mod sim;
pub mod timeq;
