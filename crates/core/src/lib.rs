pub mod lora;
pub mod version;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
