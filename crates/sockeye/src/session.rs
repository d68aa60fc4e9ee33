//! Collaborator traits for payload transforms.
//!
//! Sockets and the framing codec invoke these seams; the implementations
//! live outside this crate.

use crate::error::Result;

/// A compression session. Implementations are stateful per socket pair.
pub trait Compression: Send + Sync {
    fn deflate(&self, output: &mut Vec<u8>, input: &[u8]) -> Result<()>;
    fn inflate(&self, output: &mut Vec<u8>, input: &[u8]) -> Result<()>;
}

/// A serialization session over an opaque byte vocabulary.
pub trait Serialization: Send + Sync {
    fn encode(&self, output: &mut Vec<u8>, payload: &[u8]) -> Result<()>;
    fn decode(&self, output: &mut Vec<u8>, payload: &[u8]) -> Result<()>;
}

/// Pass-through sessions used where a transform slot must be filled.
#[derive(Debug, Default, Clone, Copy)]
pub struct Identity;

impl Compression for Identity {
    fn deflate(&self, output: &mut Vec<u8>, input: &[u8]) -> Result<()> {
        output.extend_from_slice(input);
        Ok(())
    }

    fn inflate(&self, output: &mut Vec<u8>, input: &[u8]) -> Result<()> {
        output.extend_from_slice(input);
        Ok(())
    }
}

impl Serialization for Identity {
    fn encode(&self, output: &mut Vec<u8>, payload: &[u8]) -> Result<()> {
        output.extend_from_slice(payload);
        Ok(())
    }

    fn decode(&self, output: &mut Vec<u8>, payload: &[u8]) -> Result<()> {
        output.extend_from_slice(payload);
        Ok(())
    }
}
