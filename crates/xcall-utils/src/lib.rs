//! xcall utilities

#[cfg(feature = "injector")]
pub mod injector;

#[cfg(feature = "interceptor")]
pub mod interceptor;

#[cfg(feature = "scanner")]
pub mod scanner;

#[cfg(test)]
mod mock;
