#![forbid(unsafe_code)]

use std::fmt;

use sb_core::DispatchKey;
use sb_tensor::Tensor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    WrongBackend {
        expected: DispatchKey,
        actual: DispatchKey,
    },
    BackendMismatch {
        lhs: DispatchKey,
        rhs: DispatchKey,
    },
    ShapeMismatch {
        lhs: Vec<i64>,
        rhs: Vec<i64>,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongBackend { expected, actual } => {
                write!(f, "wrong backend: expected {expected}, got {actual}")
            }
            Self::BackendMismatch { lhs, rhs } => {
                write!(f, "backend mismatch: lhs={lhs}, rhs={rhs}")
            }
            Self::ShapeMismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
        }
    }
}

impl std::error::Error for KernelError {}

fn ensure_same_backend(lhs: &Tensor, rhs: &Tensor) -> Result<(), KernelError> {
    if lhs.backend_key() != rhs.backend_key() {
        return Err(KernelError::BackendMismatch {
            lhs: lhs.backend_key(),
            rhs: rhs.backend_key(),
        });
    }
    Ok(())
}

fn ensure_backend(tensor: &Tensor, expected: DispatchKey) -> Result<(), KernelError> {
    let actual = tensor.backend_key();
    if actual != expected {
        return Err(KernelError::WrongBackend { expected, actual });
    }
    Ok(())
}

fn ensure_same_shape(lhs: &Tensor, rhs: &Tensor) -> Result<(), KernelError> {
    if lhs.sizes() != rhs.sizes() {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.sizes().to_vec(),
            rhs: rhs.sizes().to_vec(),
        });
    }
    Ok(())
}

/// Result tensor for a binary kernel: the first operand's metadata under a
/// fresh identity. The result never inherits the operand's grad flag.
fn fresh_result(lhs: &Tensor) -> Tensor {
    let out = lhs.deep_clone();
    out.set_requires_grad(false);
    out
}

/// Backends carry no storage here; a kernel checks its operands and
/// propagates metadata as a fresh tensor on its own backend.
fn binary_backend_kernel(
    backend: DispatchKey,
    lhs: &Tensor,
    rhs: &Tensor,
) -> Result<Tensor, KernelError> {
    ensure_same_backend(lhs, rhs)?;
    ensure_backend(lhs, backend)?;
    ensure_same_shape(lhs, rhs)?;
    Ok(fresh_result(lhs))
}

pub fn add_cpu(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, KernelError> {
    binary_backend_kernel(DispatchKey::CPU, lhs, rhs)
}

pub fn mul_cpu(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, KernelError> {
    binary_backend_kernel(DispatchKey::CPU, lhs, rhs)
}

pub fn add_cuda(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, KernelError> {
    binary_backend_kernel(DispatchKey::CUDA, lhs, rhs)
}

pub fn mul_cuda(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, KernelError> {
    binary_backend_kernel(DispatchKey::CUDA, lhs, rhs)
}

#[must_use]
pub fn add_scalar(lhs: f64, rhs: f64) -> f64 {
    lhs + rhs
}
