//! Integration tests for the weave: registry properties, chaining,
//! invalidation and reclamation, and multi-threaded scenarios.

#[cfg(test)]
mod exec;
#[cfg(test)]
mod registry;
