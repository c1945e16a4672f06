// Backend command handlers, called directly or through the HTTP command proxy

pub mod implementation;

pub use implementation::*;
