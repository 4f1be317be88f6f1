#![forbid(unsafe_code)]

use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use sb_core::{global_state, DispatchKey, DispatchKeySet, DispatchState};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    NotABackendKey { key: DispatchKey },
    NegativeDimension { dim: usize, size: i64 },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotABackendKey { key } => {
                write!(f, "dispatch key {key} is not a backend key")
            }
            Self::NegativeDimension { dim, size } => {
                write!(f, "negative size {size} at dim {dim}")
            }
        }
    }
}

impl std::error::Error for TensorError {}

/// Metadata-only tensor: a shape, a backend key, and a gradient flag.
///
/// Tensors are shared by reference (`Tensor` is an `Arc`); the gradient flag
/// is atomic so a toggle through one holder is observable to all of them.
/// Callers must not toggle the flag concurrently with a call that reads the
/// tensor's key set.
#[derive(Debug)]
pub struct TensorImpl {
    id: u64,
    sizes: Vec<i64>,
    backend_key: DispatchKey,
    requires_grad: AtomicBool,
}

pub type Tensor = Arc<TensorImpl>;

impl TensorImpl {
    pub fn new(sizes: Vec<i64>, backend_key: DispatchKey) -> Result<Tensor, TensorError> {
        if !backend_key.is_backend_key() {
            return Err(TensorError::NotABackendKey { key: backend_key });
        }
        for (dim, size) in sizes.iter().copied().enumerate() {
            if size < 0 {
                return Err(TensorError::NegativeDimension { dim, size });
            }
        }
        Ok(Arc::new(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            sizes,
            backend_key,
            requires_grad: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.sizes.len()
    }

    #[must_use]
    pub fn numel(&self) -> i64 {
        if self.sizes.is_empty() {
            return 0;
        }
        self.sizes.iter().product()
    }

    #[must_use]
    pub fn backend_key(&self) -> DispatchKey {
        self.backend_key
    }

    #[must_use]
    pub fn is_cpu(&self) -> bool {
        self.backend_key == DispatchKey::CPU
    }

    #[must_use]
    pub fn is_cuda(&self) -> bool {
        self.backend_key == DispatchKey::CUDA
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.requires_grad.store(requires_grad, Ordering::Relaxed);
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.requires_grad.load(Ordering::Relaxed)
    }

    /// Backend key, plus `Autograd` when the gradient flag is set, plus the
    /// functionality keys enabled process-wide.
    #[must_use]
    pub fn key_set(&self) -> DispatchKeySet {
        self.key_set_with(global_state())
    }

    #[must_use]
    pub fn key_set_with(&self, state: &DispatchState) -> DispatchKeySet {
        let mut keys = DispatchKeySet::single(self.backend_key);
        if self.requires_grad() {
            keys.add(DispatchKey::Autograd);
        }
        keys | state.functionality_keys()
    }

    /// Fresh identity with copied metadata.
    #[must_use]
    pub fn deep_clone(&self) -> Tensor {
        Arc::new(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            sizes: self.sizes.clone(),
            backend_key: self.backend_key,
            requires_grad: AtomicBool::new(self.requires_grad()),
        })
    }

    #[must_use]
    pub fn debug_string(&self) -> String {
        let mut out = String::from("shape=[");
        for (idx, size) in self.sizes.iter().enumerate() {
            if idx > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{size}");
        }
        let _ = write!(out, "], backend={}", self.backend_key);
        if self.requires_grad() {
            out.push_str(", requires_grad=true");
        }
        out
    }
}

pub fn tensor_cpu(sizes: Vec<i64>) -> Result<Tensor, TensorError> {
    TensorImpl::new(sizes, DispatchKey::CPU)
}

pub fn tensor_cuda(sizes: Vec<i64>) -> Result<Tensor, TensorError> {
    TensorImpl::new(sizes, DispatchKey::CUDA)
}

/// Union of the argument tensors' key sets; with no tensors the call is
/// routed purely by the process-wide functionality toggles.
#[must_use]
pub fn compute_dispatch_key_set(tensors: &[Tensor]) -> DispatchKeySet {
    compute_dispatch_key_set_with(tensors, global_state())
}

#[must_use]
pub fn compute_dispatch_key_set_with(
    tensors: &[Tensor],
    state: &DispatchState,
) -> DispatchKeySet {
    let mut combined = DispatchKeySet::empty();
    for tensor in tensors {
        combined |= tensor.key_set_with(state);
    }
    if combined.is_empty() {
        combined = state.functionality_keys();
    }
    combined
}
