//! The DCT (Deep Compression Transmission) emitter plug-point (§4.4, §9
//! open question): a configurable gradient-transformation hook. This
//! crate specifies only the contract — accept a raw gradient, produce
//! either a payload to transmit or a decision to accumulate it locally
//! instead — and leaves the specific compression algorithm unimplemented,
//! per the open question's resolution.

use ps_data::Tensor;

/// What an emitter decided to do with one gradient.
pub enum DctOutput {
    /// Send `tensor` over the wire in place of the raw gradient. The PS
    /// receives and applies whatever was emitted, unchanged.
    Transmit(Tensor),
    /// Nothing is sent this call; the emitter has folded the gradient into
    /// its own locally accumulated residual instead.
    Residual,
}

/// A worker-side gradient transformation applied before a push is sent.
/// Stateful implementations (e.g. an error-feedback residual buffer) hold
/// their state behind interior mutability so `emit` can take `&self`.
pub trait DctEmitter: Send + Sync {
    /// Transform one gradient for one (table_id, key-or-dense) push.
    fn emit(&self, grad: &Tensor) -> DctOutput;
}

/// The default emitter: every gradient is transmitted unchanged. Used
/// when no DCT pipeline is configured, so dispatch has one code path
/// whether or not compression is in play.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughEmitter;

impl DctEmitter for PassthroughEmitter {
    fn emit(&self, grad: &Tensor) -> DctOutput {
        DctOutput::Transmit(grad.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_data::{DeviceContext, ElementType, Shape};

    #[test]
    fn passthrough_emitter_always_transmits() {
        let grad = Tensor::zeros(Shape::vector(4), ElementType::F32, &DeviceContext::cpu());
        match PassthroughEmitter.emit(&grad) {
            DctOutput::Transmit(t) => assert_eq!(t.shape().dims(), grad.shape().dims()),
            DctOutput::Residual => panic!("passthrough must always transmit"),
        }
    }
}
