pub mod action;
pub mod bootstrap;
pub mod builtin;
pub mod implementation;
pub mod logging;
pub mod services;
