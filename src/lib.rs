pub mod functions;
pub mod logging;
pub mod schema;
pub mod services;

#[cfg(test)]
pub(crate) mod testing;
