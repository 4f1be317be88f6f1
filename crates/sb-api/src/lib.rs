#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use sb_core::{DispatchKey, DispatchKeySet};
use sb_dispatch::{DispatchError, Dispatcher, KernelFunction, OperatorName};
use sb_kernels::{add_cpu, add_cuda, add_scalar, mul_cpu, mul_cuda, KernelError};
use sb_tensor::{compute_dispatch_key_set, Tensor};
use sb_value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Dispatch,
    Autograd,
    Tracing,
    Profiling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub kind: LedgerKind,
    pub summary: String,
}

/// In-memory record of what the functionality wrappers did, in call order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchLedger {
    entries: Vec<LedgerEntry>,
}

impl DispatchLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: LedgerKind, summary: impl Into<String>) {
        self.entries.push(LedgerEntry {
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub type SharedLedger = Arc<Mutex<DispatchLedger>>;

#[must_use]
pub fn shared_ledger() -> SharedLedger {
    Arc::new(Mutex::new(DispatchLedger::new()))
}

fn ledger_guard(ledger: &SharedLedger) -> MutexGuard<'_, DispatchLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record(ledger: &SharedLedger, kind: LedgerKind, summary: String) {
    ledger_guard(ledger).record(kind, summary);
}

fn collect_tensors(args: &[Value]) -> Vec<Tensor> {
    let mut tensors = Vec::new();
    for arg in args {
        match arg {
            Value::Tensor(tensor) => tensors.push(tensor.clone()),
            Value::TensorList(list) => tensors.extend(list.iter().cloned()),
            _ => {}
        }
    }
    tensors
}

/// Key set a wrapper redispatches with. Recomputing from the arguments
/// re-adds every functionality key, so stripping only the wrapper's own key
/// would hand an outer wrapper's key back to dispatch and loop. Every
/// functionality key at or above this wrapper's precedence has already run;
/// stripping them all keeps each redispatch strictly smaller.
fn reduced_key_set(own: DispatchKey, tensors: &[Tensor]) -> DispatchKeySet {
    let mut keys = compute_dispatch_key_set(tensors);
    for key in DispatchKey::all().iter().copied() {
        if key.is_functionality_key() && key.priority() <= own.priority() {
            keys.remove(key);
        }
    }
    keys
}

/// Autograd wrapper kernel: strips its own key, redispatches, then marks
/// every output tensor for gradient tracking when any input required grad.
pub fn autograd_wrapper(
    dispatcher: Arc<Dispatcher>,
    op: OperatorName,
    ledger: SharedLedger,
) -> KernelFunction {
    KernelFunction::from_boxed(move |args| {
        let tensors = collect_tensors(args);
        let needs_grad = tensors.iter().any(|tensor| tensor.requires_grad());

        let keys = reduced_key_set(DispatchKey::Autograd, &tensors);
        record(
            &ledger,
            LedgerKind::Autograd,
            format!("{op}: redispatching to {keys}"),
        );

        let results = dispatcher.call_with_keys(op.clone(), keys, args)?;

        if needs_grad {
            let mut marked = 0usize;
            for value in &results {
                if let Value::Tensor(tensor) = value {
                    tensor.set_requires_grad(true);
                    marked += 1;
                }
            }
            record(
                &ledger,
                LedgerKind::Autograd,
                format!("{op}: marked {marked} outputs for grad"),
            );
        }
        Ok(results)
    })
}

/// Tracing wrapper kernel: records the operation into the ledger before and
/// after redispatching with its own key removed.
pub fn tracing_wrapper(
    dispatcher: Arc<Dispatcher>,
    op: OperatorName,
    ledger: SharedLedger,
) -> KernelFunction {
    KernelFunction::from_boxed(move |args| {
        let tensors = collect_tensors(args);
        let keys = reduced_key_set(DispatchKey::Tracing, &tensors);
        record(
            &ledger,
            LedgerKind::Tracing,
            format!("{op}: redispatching to {keys}"),
        );

        let results = dispatcher.call_with_keys(op.clone(), keys, args)?;

        record(
            &ledger,
            LedgerKind::Tracing,
            format!("{op}: recorded {} results to trace", results.len()),
        );
        Ok(results)
    })
}

/// Profiling wrapper kernel: times the redispatch and records the elapsed
/// wall-clock time.
pub fn profiling_wrapper(
    dispatcher: Arc<Dispatcher>,
    op: OperatorName,
    ledger: SharedLedger,
) -> KernelFunction {
    KernelFunction::from_boxed(move |args| {
        let tensors = collect_tensors(args);
        let keys = reduced_key_set(DispatchKey::Profiling, &tensors);

        let start = Instant::now();
        let results = dispatcher.call_with_keys(op.clone(), keys, args)?;
        let elapsed_us = start.elapsed().as_micros();

        record(
            &ledger,
            LedgerKind::Profiling,
            format!("{op}: completed in {elapsed_us} us"),
        );
        Ok(results)
    })
}

/// Boxed adapter for a fallible binary tensor kernel, validating the
/// argument list the way the backend kernels expect it.
fn binary_tensor_kernel(
    kernel: fn(&Tensor, &Tensor) -> Result<Tensor, KernelError>,
) -> KernelFunction {
    KernelFunction::from_boxed(move |args| {
        if args.len() != 2 {
            return Err(DispatchError::ArityMismatch {
                expected: 2,
                got: args.len(),
            });
        }
        let lhs = args[0].to_tensor()?;
        let rhs = args[1].to_tensor()?;
        let out = kernel(&lhs, &rhs)?;
        Ok(vec![Value::Tensor(out)])
    })
}

fn fresh_like(source: &Tensor) -> Tensor {
    let out = source.deep_clone();
    out.set_requires_grad(false);
    out
}

/// Installs the stock operator set on `dispatcher`:
///
/// - `add`: boxed CPU/CUDA kernels plus the three functionality wrappers;
/// - `mul`: boxed CPU/CUDA kernels;
/// - `add.unboxed`: strongly-typed CPU/CUDA kernels through the boxing
///   adapter;
/// - `add_scalar`: strongly-typed scalar kernel on `CatchAll`, so purely
///   scalar calls (whose key set is empty) still route to it;
/// - `tensor_info`: unit-returning kernel recording the operand into the
///   ledger.
pub fn register_standard_ops(dispatcher: &Arc<Dispatcher>, ledger: &SharedLedger) {
    let add = dispatcher.register_operator("add");
    add.set_kernel(DispatchKey::CPU, binary_tensor_kernel(add_cpu));
    add.set_kernel(DispatchKey::CUDA, binary_tensor_kernel(add_cuda));
    add.set_kernel(
        DispatchKey::Autograd,
        autograd_wrapper(
            dispatcher.clone(),
            OperatorName::new("add"),
            ledger.clone(),
        ),
    );
    add.set_kernel(
        DispatchKey::Tracing,
        tracing_wrapper(
            dispatcher.clone(),
            OperatorName::new("add"),
            ledger.clone(),
        ),
    );
    add.set_kernel(
        DispatchKey::Profiling,
        profiling_wrapper(
            dispatcher.clone(),
            OperatorName::new("add"),
            ledger.clone(),
        ),
    );

    let mul = dispatcher.register_operator("mul");
    mul.set_kernel(DispatchKey::CPU, binary_tensor_kernel(mul_cpu));
    mul.set_kernel(DispatchKey::CUDA, binary_tensor_kernel(mul_cuda));

    let add_unboxed = dispatcher.register_operator(OperatorName::with_overload("add", "unboxed"));
    let unboxed = KernelFunction::from_unboxed(|lhs: Tensor, _rhs: Tensor| -> Tensor {
        fresh_like(&lhs)
    });
    add_unboxed.set_kernel(DispatchKey::CPU, unboxed.clone());
    add_unboxed.set_kernel(DispatchKey::CUDA, unboxed);

    let scalar = dispatcher.register_operator("add_scalar");
    scalar.set_kernel(DispatchKey::CatchAll, KernelFunction::from_unboxed(add_scalar));

    let info = dispatcher.register_operator("tensor_info");
    let info_ledger = ledger.clone();
    let info_kernel = KernelFunction::from_unboxed(move |tensor: Tensor| {
        ledger_guard(&info_ledger).record(
            LedgerKind::Dispatch,
            format!("tensor_info: {}", tensor.debug_string()),
        );
    });
    info.set_kernel(DispatchKey::CPU, info_kernel.clone());
    info.set_kernel(DispatchKey::CUDA, info_kernel);
}
