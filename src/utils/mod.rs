/// Implement common traits for raw pointer wrappers.
#[macro_use]
pub(crate) mod boilerplate;

/// Provide interoperability with C return values.
pub(crate) mod interop;
