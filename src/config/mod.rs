// Server-level configuration outside config.yaml

pub mod secrets;

pub use secrets::SecretsConfig;
