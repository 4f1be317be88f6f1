#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard};

use sb_core::{DispatchKey, DispatchKeySet, NUM_DISPATCH_KEYS};
use sb_kernels::KernelError;
use sb_tensor::compute_dispatch_key_set;
use sb_value::{FromValue, IntoValue, Value, ValueError};
use serde::{Deserialize, Serialize};

pub const STATS_REPORT_SCHEMA_VERSION: u32 = 1;

/// Operator identity: a base name plus an optional overload token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorName {
    name: String,
    overload_name: Option<String>,
}

impl OperatorName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overload_name: None,
        }
    }

    pub fn with_overload(name: impl Into<String>, overload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overload_name: Some(overload.into()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn overload_name(&self) -> Option<&str> {
        self.overload_name.as_deref()
    }

    /// `"name.overload"` when an overload is present, otherwise `"name"`.
    #[must_use]
    pub fn full_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for OperatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.overload_name {
            Some(overload) => write!(f, "{}.{}", self.name, overload),
            None => f.write_str(&self.name),
        }
    }
}

impl From<&str> for OperatorName {
    fn from(value: &str) -> Self {
        match value.split_once('.') {
            Some((name, overload)) if !overload.is_empty() => {
                Self::with_overload(name, overload)
            }
            Some((name, _)) => Self::new(name),
            None => Self::new(value),
        }
    }
}

impl From<String> for OperatorName {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    OperatorNotFound {
        name: OperatorName,
    },
    NoKernelFound {
        name: OperatorName,
        key_set: DispatchKeySet,
    },
    InvalidKernel,
    ArityMismatch {
        expected: usize,
        got: usize,
    },
    Value(ValueError),
    Kernel(KernelError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorNotFound { name } => {
                write!(f, "operator '{name}' is not registered")
            }
            Self::NoKernelFound { name, key_set } => {
                write!(
                    f,
                    "no kernel found for operator '{name}' with dispatch key set {key_set}"
                )
            }
            Self::InvalidKernel => f.write_str("attempted to call an invalid kernel function"),
            Self::ArityMismatch { expected, got } => {
                write!(f, "arity mismatch: expected {expected} arguments, got {got}")
            }
            Self::Value(error) => write!(f, "argument error: {error}"),
            Self::Kernel(error) => write!(f, "kernel failure: {error}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ValueError> for DispatchError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

impl From<KernelError> for DispatchError {
    fn from(value: KernelError) -> Self {
        Self::Kernel(value)
    }
}

/// Result half of the boxing adapter: unit becomes the empty result list,
/// every payload type becomes a one-element list.
pub trait KernelReturn {
    fn into_results(self) -> Vec<Value>;
}

impl KernelReturn for () {
    fn into_results(self) -> Vec<Value> {
        Vec::new()
    }
}

macro_rules! impl_kernel_return {
    ($($payload:ty),* $(,)?) => {
        $(
            impl KernelReturn for $payload {
                fn into_results(self) -> Vec<Value> {
                    vec![self.into_value()]
                }
            }
        )*
    };
}

impl_kernel_return!(
    sb_tensor::Tensor,
    f64,
    i64,
    bool,
    String,
    Vec<i64>,
    Vec<f64>,
    Vec<sb_tensor::Tensor>,
);

/// A strongly-typed callable usable as a kernel: every argument type has a
/// [`FromValue`] impl and the return type has a [`KernelReturn`] impl. The
/// blanket impls below cover arities 0 through 4.
pub trait UnboxedKernel<Args> {
    const ARITY: usize;

    fn invoke(&self, args: &[Value]) -> Result<Vec<Value>, DispatchError>;
}

macro_rules! impl_unboxed_kernel {
    ($arity:expr $(, ($ty:ident, $var:ident, $idx:tt))*) => {
        impl<Fun, Ret $(, $ty)*> UnboxedKernel<($($ty,)*)> for Fun
        where
            Fun: Fn($($ty),*) -> Ret,
            Ret: KernelReturn,
            $($ty: FromValue,)*
        {
            const ARITY: usize = $arity;

            fn invoke(&self, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
                if args.len() != $arity {
                    return Err(DispatchError::ArityMismatch {
                        expected: $arity,
                        got: args.len(),
                    });
                }
                $(let $var = <$ty as FromValue>::from_value(&args[$idx])?;)*
                Ok((self)($($var),*).into_results())
            }
        }
    };
}

impl_unboxed_kernel!(0);
impl_unboxed_kernel!(1, (A0, a0, 0));
impl_unboxed_kernel!(2, (A0, a0, 0), (A1, a1, 1));
impl_unboxed_kernel!(3, (A0, a0, 0), (A1, a1, 1), (A2, a2, 2));
impl_unboxed_kernel!(4, (A0, a0, 0), (A1, a1, 1), (A2, a2, 2), (A3, a3, 3));

pub type BoxedKernel = dyn Fn(&[Value]) -> Result<Vec<Value>, DispatchError> + Send + Sync;

/// Uniform callable over the boxed calling convention. Whether the kernel
/// was registered boxed or strongly typed is invisible to the caller.
#[derive(Clone, Default)]
pub struct KernelFunction {
    boxed: Option<Arc<BoxedKernel>>,
}

impl fmt::Debug for KernelFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.write_str("KernelFunction(valid)")
        } else {
            f.write_str("KernelFunction(invalid)")
        }
    }
}

impl KernelFunction {
    #[must_use]
    pub fn invalid() -> Self {
        Self { boxed: None }
    }

    pub fn from_boxed<F>(kernel: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, DispatchError> + Send + Sync + 'static,
    {
        Self {
            boxed: Some(Arc::new(kernel)),
        }
    }

    /// Wraps a strongly-typed kernel in the boxing adapter: argument count
    /// and variant tags are validated, typed arguments are extracted by
    /// position, and the result is wrapped back into a value list.
    pub fn from_unboxed<Args, F>(kernel: F) -> Self
    where
        F: UnboxedKernel<Args> + Send + Sync + 'static,
    {
        Self::from_boxed(move |args| kernel.invoke(args))
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.boxed.is_some()
    }

    pub fn call_boxed(&self, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
        match &self.boxed {
            Some(kernel) => kernel(args),
            None => Err(DispatchError::InvalidKernel),
        }
    }
}

type DispatchTable = [Option<KernelFunction>; NUM_DISPATCH_KEYS];

/// Per-operator dispatch table: one optional kernel per dispatch key, dense
/// because the key roster is closed and small.
#[derive(Debug)]
pub struct OperatorHandle {
    name: OperatorName,
    table: RwLock<DispatchTable>,
}

impl OperatorHandle {
    pub fn new(name: impl Into<OperatorName>) -> Self {
        Self {
            name: name.into(),
            table: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &OperatorName {
        &self.name
    }

    fn read_table(&self) -> RwLockReadGuard<'_, DispatchTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_kernel(&self, key: DispatchKey, kernel: KernelFunction) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table[key.index()] = Some(kernel);
    }

    pub fn remove_kernel(&self, key: DispatchKey) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table[key.index()] = None;
    }

    #[must_use]
    pub fn has_kernel(&self, key: DispatchKey) -> bool {
        self.read_table()[key.index()].is_some()
    }

    /// Dispatch selection: the first registered kernel in the key set's
    /// priority order, falling back to `CatchAll` when no member matches.
    #[must_use]
    pub fn find_kernel(&self, key_set: DispatchKeySet) -> Option<KernelFunction> {
        let table = self.read_table();
        for key in key_set.iter() {
            if let Some(kernel) = &table[key.index()] {
                return Some(kernel.clone());
            }
        }
        table[DispatchKey::CatchAll.index()].clone()
    }

    #[must_use]
    pub fn registered_keys(&self) -> Vec<DispatchKey> {
        let table = self.read_table();
        let mut keys = DispatchKeySet::empty();
        for key in DispatchKey::all().iter().copied() {
            if table[key.index()].is_some() {
                keys.add(key);
            }
        }
        keys.to_vec()
    }

    /// Key set for a call: the union over all tensor arguments, with
    /// tensor-list arguments flattened in order.
    #[must_use]
    pub fn compute_dispatch_key_set(&self, args: &[Value]) -> DispatchKeySet {
        let mut tensors = Vec::new();
        for arg in args {
            match arg {
                Value::Tensor(tensor) => tensors.push(tensor.clone()),
                Value::TensorList(list) => tensors.extend(list.iter().cloned()),
                _ => {}
            }
        }
        compute_dispatch_key_set(&tensors)
    }

    pub fn call_with_keys(
        &self,
        key_set: DispatchKeySet,
        args: &[Value],
    ) -> Result<Vec<Value>, DispatchError> {
        let kernel = self
            .find_kernel(key_set)
            .ok_or_else(|| DispatchError::NoKernelFound {
                name: self.name.clone(),
                key_set,
            })?;
        kernel.call_boxed(args)
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
        self.call_with_keys(self.compute_dispatch_key_set(args), args)
    }

    #[must_use]
    pub fn debug_string(&self) -> String {
        let mut out = format!("OperatorHandle({}) {{\n", self.name);
        for key in self.registered_keys() {
            let _ = writeln!(out, "  {key}: registered");
        }
        out.push('}');
        out
    }
}

/// Per-operator call statistics collected while profiling is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    pub call_count: u64,
    pub key_counts: HashMap<DispatchKey, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorStatsEntry {
    pub operator: String,
    pub call_count: u64,
    pub key_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallStatsReport {
    pub schema_version: u32,
    pub operators: Vec<OperatorStatsEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    Json { message: String },
    SchemaVersionMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json { message } => write!(f, "stats report json failure: {message}"),
            Self::SchemaVersionMismatch { expected, actual } => {
                write!(
                    f,
                    "stats report schema version mismatch: expected {expected}, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for ReportError {}

pub fn encode_stats_report(report: &CallStatsReport) -> Result<String, ReportError> {
    serde_json::to_string(report).map_err(|error| ReportError::Json {
        message: error.to_string(),
    })
}

pub fn decode_stats_report(input: &str) -> Result<CallStatsReport, ReportError> {
    let report: CallStatsReport =
        serde_json::from_str(input).map_err(|error| ReportError::Json {
            message: error.to_string(),
        })?;
    if report.schema_version != STATS_REPORT_SCHEMA_VERSION {
        return Err(ReportError::SchemaVersionMismatch {
            expected: STATS_REPORT_SCHEMA_VERSION,
            actual: report.schema_version,
        });
    }
    Ok(report)
}

pub type RegistrationCallback = Box<dyn Fn(&OperatorName, bool) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide operator registry and call entry point.
///
/// The registry and the statistics map sit behind separate mutexes so calls
/// recording statistics do not contend with registration traffic.
pub struct Dispatcher {
    operators: Mutex<HashMap<OperatorName, Arc<OperatorHandle>>>,
    callbacks: Mutex<Vec<RegistrationCallback>>,
    profiling_enabled: AtomicBool,
    stats: Mutex<HashMap<OperatorName, CallStats>>,
}

static GLOBAL_DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("operators", &lock(&self.operators).len())
            .field("profiling_enabled", &self.is_profiling_enabled())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            operators: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            profiling_enabled: AtomicBool::new(false),
            stats: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn global() -> &'static Dispatcher {
        GLOBAL_DISPATCHER.get_or_init(Dispatcher::new)
    }

    /// Idempotent: a second registration of the same name returns the
    /// existing handle and does not fire callbacks again.
    pub fn register_operator(&self, name: impl Into<OperatorName>) -> Arc<OperatorHandle> {
        let name = name.into();
        let (handle, inserted) = {
            let mut operators = lock(&self.operators);
            match operators.entry(name.clone()) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let handle = Arc::new(OperatorHandle::new(name.clone()));
                    entry.insert(handle.clone());
                    (handle, true)
                }
            }
        };
        if inserted {
            self.notify_registration(&name, true);
        }
        handle
    }

    #[must_use]
    pub fn find_operator(&self, name: &OperatorName) -> Option<Arc<OperatorHandle>> {
        lock(&self.operators).get(name).cloned()
    }

    #[must_use]
    pub fn has_operator(&self, name: &OperatorName) -> bool {
        lock(&self.operators).contains_key(name)
    }

    pub fn deregister_operator(&self, name: &OperatorName) -> bool {
        let removed = lock(&self.operators).remove(name).is_some();
        if removed {
            self.notify_registration(name, false);
        }
        removed
    }

    /// Names in no particular order.
    #[must_use]
    pub fn all_operator_names(&self) -> Vec<OperatorName> {
        lock(&self.operators).keys().cloned().collect()
    }

    pub fn call(
        &self,
        name: impl Into<OperatorName>,
        args: &[Value],
    ) -> Result<Vec<Value>, DispatchError> {
        let name = name.into();
        let handle = self
            .find_operator(&name)
            .ok_or_else(|| DispatchError::OperatorNotFound { name: name.clone() })?;
        let key_set = handle.compute_dispatch_key_set(args);
        let result = handle.call_with_keys(key_set, args)?;
        if self.is_profiling_enabled() {
            self.record_call(&name, key_set.highest_priority_key());
        }
        Ok(result)
    }

    /// Uses the caller-supplied key set verbatim; functionality wrappers
    /// redispatch through this entry point after stripping their own key.
    pub fn call_with_keys(
        &self,
        name: impl Into<OperatorName>,
        key_set: DispatchKeySet,
        args: &[Value],
    ) -> Result<Vec<Value>, DispatchError> {
        let name = name.into();
        let handle = self
            .find_operator(&name)
            .ok_or_else(|| DispatchError::OperatorNotFound { name: name.clone() })?;
        let result = handle.call_with_keys(key_set, args)?;
        if self.is_profiling_enabled() {
            self.record_call(&name, key_set.highest_priority_key());
        }
        Ok(result)
    }

    pub fn add_registration_callback(&self, callback: RegistrationCallback) {
        lock(&self.callbacks).push(callback);
    }

    fn notify_registration(&self, name: &OperatorName, registered: bool) {
        let callbacks = lock(&self.callbacks);
        for callback in callbacks.iter() {
            // A misbehaving observer must not poison the registry.
            let _ = catch_unwind(AssertUnwindSafe(|| callback(name, registered)));
        }
    }

    pub fn enable_profiling(&self, enabled: bool) {
        self.profiling_enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_profiling_enabled(&self) -> bool {
        self.profiling_enabled.load(Ordering::Relaxed)
    }

    fn record_call(&self, name: &OperatorName, key: DispatchKey) {
        let mut stats = lock(&self.stats);
        let entry = stats.entry(name.clone()).or_default();
        entry.call_count += 1;
        *entry.key_counts.entry(key).or_insert(0) += 1;
    }

    #[must_use]
    pub fn call_stats(&self) -> HashMap<OperatorName, CallStats> {
        lock(&self.stats).clone()
    }

    pub fn reset_call_stats(&self) {
        lock(&self.stats).clear();
    }

    /// Deterministic, versioned snapshot of the call statistics.
    #[must_use]
    pub fn stats_report(&self) -> CallStatsReport {
        let stats = lock(&self.stats);
        let mut operators: Vec<OperatorStatsEntry> = stats
            .iter()
            .map(|(name, stat)| OperatorStatsEntry {
                operator: name.full_name(),
                call_count: stat.call_count,
                key_counts: stat
                    .key_counts
                    .iter()
                    .map(|(key, count)| (key.name().to_string(), *count))
                    .collect(),
            })
            .collect();
        operators.sort_by(|a, b| a.operator.cmp(&b.operator));
        CallStatsReport {
            schema_version: STATS_REPORT_SCHEMA_VERSION,
            operators,
        }
    }

    #[must_use]
    pub fn debug_string(&self) -> String {
        let handles: Vec<Arc<OperatorHandle>> = {
            let operators = lock(&self.operators);
            let mut handles: Vec<_> = operators.values().cloned().collect();
            handles.sort_by(|a, b| a.name().cmp(b.name()));
            handles
        };

        let mut out = String::from("Dispatcher {\n");
        let _ = writeln!(out, "  Registered operators: {}", handles.len());
        for handle in &handles {
            let _ = writeln!(out, "  {} {{", handle.name());
            for key in handle.registered_keys() {
                let _ = writeln!(out, "    {key}");
            }
            out.push_str("  }\n");
        }

        if self.is_profiling_enabled() {
            out.push_str("  Call statistics:\n");
            for entry in self.stats_report().operators {
                let _ = writeln!(out, "    {}: {} calls", entry.operator, entry.call_count);
                for (key, count) in &entry.key_counts {
                    let _ = writeln!(out, "      {key}: {count} times");
                }
            }
        }

        out.push('}');
        out
    }
}

/// Registers `name` on the process-wide dispatcher.
pub fn register_op(name: impl Into<OperatorName>) -> Arc<OperatorHandle> {
    Dispatcher::global().register_operator(name)
}

/// Calls `name` on the process-wide dispatcher, computing the key set from
/// the arguments.
pub fn call_op(name: impl Into<OperatorName>, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
    Dispatcher::global().call(name, args)
}

/// Calls `name` on the process-wide dispatcher with an explicit key set.
pub fn call_op_with_keys(
    name: impl Into<OperatorName>,
    key_set: DispatchKeySet,
    args: &[Value],
) -> Result<Vec<Value>, DispatchError> {
    Dispatcher::global().call_with_keys(name, key_set, args)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    use sb_core::{DispatchKey, DispatchKeySet};
    use sb_tensor::{tensor_cpu, tensor_cuda, Tensor};
    use sb_value::{Tag, Value, ValueError};

    use super::{
        decode_stats_report, encode_stats_report, CallStatsReport, DispatchError, Dispatcher,
        KernelFunction, OperatorHandle, OperatorName, OperatorStatsEntry,
        STATS_REPORT_SCHEMA_VERSION,
    };

    fn tensor_passthrough() -> KernelFunction {
        KernelFunction::from_boxed(|args| Ok(args.to_vec()))
    }

    #[test]
    fn operator_name_textual_forms() {
        assert_eq!(OperatorName::new("add").full_name(), "add");
        assert_eq!(
            OperatorName::with_overload("add", "unboxed").full_name(),
            "add.unboxed"
        );

        let parsed = OperatorName::from("add.unboxed");
        assert_eq!(parsed.name(), "add");
        assert_eq!(parsed.overload_name(), Some("unboxed"));

        let bare = OperatorName::from("add");
        assert_eq!(bare.overload_name(), None);

        let trailing_dot = OperatorName::from("add.");
        assert_eq!(trailing_dot, OperatorName::new("add"));
    }

    #[test]
    fn invalid_kernel_fails_closed() {
        let kernel = KernelFunction::invalid();
        assert!(!kernel.is_valid());
        assert_eq!(
            kernel.call_boxed(&[]).expect_err("invalid kernel"),
            DispatchError::InvalidKernel
        );
    }

    #[test]
    fn boxed_kernels_pass_errors_through_unchanged() {
        let kernel = KernelFunction::from_boxed(|_args| {
            Err(DispatchError::Kernel(sb_kernels::KernelError::ShapeMismatch {
                lhs: vec![1],
                rhs: vec![2],
            }))
        });
        let err = kernel.call_boxed(&[]).expect_err("kernel error");
        assert_eq!(
            err,
            DispatchError::Kernel(sb_kernels::KernelError::ShapeMismatch {
                lhs: vec![1],
                rhs: vec![2],
            })
        );
    }

    #[test]
    fn unboxed_tensor_kernel_round_trips() {
        let kernel = KernelFunction::from_unboxed(|lhs: Tensor, _rhs: Tensor| -> Tensor {
            lhs.deep_clone()
        });
        let lhs = tensor_cpu(vec![2, 2]).expect("cpu tensor");
        let rhs = tensor_cpu(vec![2, 2]).expect("cpu tensor");

        let results = kernel
            .call_boxed(&[Value::Tensor(lhs.clone()), Value::Tensor(rhs)])
            .expect("unboxed call");
        assert_eq!(results.len(), 1);
        let out = results[0].to_tensor().expect("tensor result");
        assert_eq!(out.sizes(), lhs.sizes());
    }

    #[test]
    fn unboxed_scalar_kernel_round_trips() {
        let kernel = KernelFunction::from_unboxed(|a: f64, b: f64| -> f64 { a + b });
        let results = kernel
            .call_boxed(&[Value::Double(3.5), Value::Double(2.5)])
            .expect("scalar call");
        assert_eq!(results, vec![Value::Double(6.0)]);
    }

    #[test]
    fn unboxed_unit_return_yields_empty_results() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_kernel = seen.clone();
        let kernel = KernelFunction::from_unboxed(move |_tensor: Tensor| {
            seen_in_kernel.fetch_add(1, Ordering::Relaxed);
        });

        let tensor = tensor_cpu(vec![2]).expect("cpu tensor");
        let results = kernel
            .call_boxed(&[Value::Tensor(tensor)])
            .expect("unit call");
        assert!(results.is_empty());
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unboxed_zero_arity_kernel() {
        let kernel = KernelFunction::from_unboxed(|| -> i64 { 41 + 1 });
        assert_eq!(
            kernel.call_boxed(&[]).expect("nullary call"),
            vec![Value::Int(42)]
        );
    }

    #[test]
    fn unboxed_arity_mismatch() {
        let kernel =
            KernelFunction::from_unboxed(|lhs: Tensor, _rhs: Tensor| -> Tensor { lhs });
        let tensor = tensor_cpu(vec![2, 2]).expect("cpu tensor");

        let err = kernel
            .call_boxed(&[Value::Tensor(tensor)])
            .expect_err("arity mismatch");
        assert_eq!(
            err,
            DispatchError::ArityMismatch {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn unboxed_type_mismatch_reports_first_bad_position() {
        let kernel =
            KernelFunction::from_unboxed(|lhs: Tensor, _rhs: Tensor| -> Tensor { lhs });
        let tensor = tensor_cpu(vec![2, 2]).expect("cpu tensor");

        let err = kernel
            .call_boxed(&[Value::Double(3.14), Value::Tensor(tensor)])
            .expect_err("type mismatch");
        assert_eq!(
            err,
            DispatchError::Value(ValueError::TypeMismatch {
                expected: Tag::Tensor,
                got: Tag::Double
            })
        );
    }

    #[test]
    fn mixed_arity_kernel_accepts_tensor_and_scalar() {
        let kernel = KernelFunction::from_unboxed(|tensor: Tensor, scalar: f64| -> Tensor {
            let _ = scalar;
            tensor.deep_clone()
        });
        let tensor = tensor_cpu(vec![2, 3]).expect("cpu tensor");
        let results = kernel
            .call_boxed(&[Value::Tensor(tensor), Value::Double(5.0)])
            .expect("mixed call");
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn set_remove_has_kernel() {
        let handle = OperatorHandle::new("probe");
        assert!(!handle.has_kernel(DispatchKey::CPU));

        handle.set_kernel(DispatchKey::CPU, tensor_passthrough());
        assert!(handle.has_kernel(DispatchKey::CPU));
        assert_eq!(handle.registered_keys(), vec![DispatchKey::CPU]);

        handle.remove_kernel(DispatchKey::CPU);
        handle.remove_kernel(DispatchKey::CPU);
        assert!(!handle.has_kernel(DispatchKey::CPU));
    }

    #[test]
    fn find_kernel_prefers_priority_order() {
        let handle = OperatorHandle::new("probe");
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        for (key, label) in [
            (DispatchKey::CPU, "cpu"),
            (DispatchKey::Autograd, "autograd"),
        ] {
            let order = order.clone();
            handle.set_kernel(
                key,
                KernelFunction::from_boxed(move |_args| {
                    order.lock().expect("order lock").push(label);
                    Ok(Vec::new())
                }),
            );
        }

        let keys = DispatchKeySet::from_keys(&[DispatchKey::CPU, DispatchKey::Autograd]);
        handle
            .call_with_keys(keys, &[])
            .expect("dispatch to autograd");
        assert_eq!(*order.lock().expect("order lock"), vec!["autograd"]);
    }

    #[test]
    fn catch_all_is_the_fallback_for_every_key_set() {
        let handle = OperatorHandle::new("probe");
        handle.set_kernel(DispatchKey::CatchAll, tensor_passthrough());

        for key in DispatchKey::all().iter().copied() {
            assert!(
                handle.find_kernel(DispatchKeySet::single(key)).is_some(),
                "catch-all not selected for {{{key}}}"
            );
        }
    }

    #[test]
    fn specific_kernel_beats_catch_all() {
        let handle = OperatorHandle::new("probe");
        let hits: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        for (key, label) in [
            (DispatchKey::CPU, "cpu"),
            (DispatchKey::CatchAll, "catch_all"),
        ] {
            let hits = hits.clone();
            handle.set_kernel(
                key,
                KernelFunction::from_boxed(move |_args| {
                    hits.lock().expect("hits lock").push(label);
                    Ok(Vec::new())
                }),
            );
        }

        handle
            .call_with_keys(DispatchKeySet::single(DispatchKey::CPU), &[])
            .expect("cpu dispatch");
        handle
            .call_with_keys(DispatchKeySet::single(DispatchKey::CUDA), &[])
            .expect("fallback dispatch");
        assert_eq!(*hits.lock().expect("hits lock"), vec!["cpu", "catch_all"]);
    }

    #[test]
    fn missing_kernel_reports_name_and_key_set() {
        let handle = OperatorHandle::new("probe");
        handle.set_kernel(DispatchKey::CUDA, tensor_passthrough());

        let keys = DispatchKeySet::single(DispatchKey::CPU);
        let err = handle.call_with_keys(keys, &[]).expect_err("no kernel");
        assert_eq!(
            err,
            DispatchError::NoKernelFound {
                name: OperatorName::new("probe"),
                key_set: keys
            }
        );
        assert_eq!(
            err.to_string(),
            "no kernel found for operator 'probe' with dispatch key set {CPU}"
        );
    }

    #[test]
    fn key_set_computation_flattens_tensor_lists() {
        let handle = OperatorHandle::new("probe");
        let cpu = tensor_cpu(vec![2]).expect("cpu tensor");
        let cuda = tensor_cuda(vec![2]).expect("cuda tensor");

        let keys = handle.compute_dispatch_key_set(&[
            Value::Int(1),
            Value::Tensor(cpu),
            Value::TensorList(vec![cuda]),
        ]);
        assert!(keys.has(DispatchKey::CPU));
        assert!(keys.has(DispatchKey::CUDA));
    }

    #[test]
    fn handle_debug_string_lists_registered_keys() {
        let handle = OperatorHandle::new("probe");
        handle.set_kernel(DispatchKey::CPU, tensor_passthrough());
        handle.set_kernel(DispatchKey::Autograd, tensor_passthrough());

        assert_eq!(
            handle.debug_string(),
            "OperatorHandle(probe) {\n  Autograd: registered\n  CPU: registered\n}"
        );
    }

    #[test]
    fn registration_is_idempotent_and_notifies_once() {
        let dispatcher = Dispatcher::new();
        let events: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dispatcher.add_registration_callback(Box::new(move |name, registered| {
            sink.lock()
                .expect("events lock")
                .push((name.full_name(), registered));
        }));

        let first = dispatcher.register_operator("add");
        let second = dispatcher.register_operator("add");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(dispatcher.has_operator(&OperatorName::new("add")));

        assert!(dispatcher.deregister_operator(&OperatorName::new("add")));
        assert!(!dispatcher.deregister_operator(&OperatorName::new("add")));

        assert_eq!(
            *events.lock().expect("events lock"),
            vec![(String::from("add"), true), (String::from("add"), false)]
        );
    }

    #[test]
    fn callback_panics_are_contained() {
        let dispatcher = Dispatcher::new();
        dispatcher.add_registration_callback(Box::new(|_name, _registered| {
            panic!("observer failure");
        }));

        let handle = dispatcher.register_operator("resilient");
        assert_eq!(handle.name().full_name(), "resilient");
        assert!(dispatcher.has_operator(&OperatorName::new("resilient")));
    }

    #[test]
    fn call_requires_a_registered_operator() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher.call("ghost", &[]).expect_err("unregistered");
        assert_eq!(
            err,
            DispatchError::OperatorNotFound {
                name: OperatorName::new("ghost")
            }
        );
        assert_eq!(err.to_string(), "operator 'ghost' is not registered");
    }

    #[test]
    fn all_operator_names_enumerates_the_registry() {
        let dispatcher = Dispatcher::new();
        dispatcher.register_operator("a");
        dispatcher.register_operator(OperatorName::with_overload("a", "x"));

        let mut names: Vec<String> = dispatcher
            .all_operator_names()
            .iter()
            .map(OperatorName::full_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "a.x"]);
    }

    #[test]
    fn profiling_counts_calls_per_key() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.register_operator("add");
        handle.set_kernel(DispatchKey::CPU, tensor_passthrough());

        dispatcher.enable_profiling(true);
        for _ in 0..3 {
            let lhs = tensor_cpu(vec![2, 2]).expect("cpu tensor");
            let rhs = tensor_cpu(vec![2, 2]).expect("cpu tensor");
            dispatcher
                .call("add", &[Value::Tensor(lhs), Value::Tensor(rhs)])
                .expect("profiled call");
        }

        let stats = dispatcher.call_stats();
        let add_stats = stats
            .get(&OperatorName::new("add"))
            .expect("stats for add");
        assert_eq!(add_stats.call_count, 3);
        assert_eq!(add_stats.key_counts.get(&DispatchKey::CPU), Some(&3));
        assert_eq!(add_stats.key_counts.len(), 1);

        dispatcher.reset_call_stats();
        assert!(dispatcher.call_stats().is_empty());
    }

    #[test]
    fn profiling_disabled_records_nothing() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.register_operator("add");
        handle.set_kernel(DispatchKey::CPU, tensor_passthrough());

        let lhs = tensor_cpu(vec![2]).expect("cpu tensor");
        dispatcher
            .call("add", &[Value::Tensor(lhs)])
            .expect("unprofiled call");
        assert!(dispatcher.call_stats().is_empty());
    }

    #[test]
    fn stats_report_is_sorted_and_round_trips() {
        let dispatcher = Dispatcher::new();
        for name in ["zeta", "alpha"] {
            let handle = dispatcher.register_operator(name);
            handle.set_kernel(DispatchKey::CPU, tensor_passthrough());
        }
        dispatcher.enable_profiling(true);
        for name in ["zeta", "alpha", "zeta"] {
            let tensor = tensor_cpu(vec![1]).expect("cpu tensor");
            dispatcher
                .call(name, &[Value::Tensor(tensor)])
                .expect("profiled call");
        }

        let report = dispatcher.stats_report();
        assert_eq!(report.schema_version, STATS_REPORT_SCHEMA_VERSION);
        let names: Vec<&str> = report
            .operators
            .iter()
            .map(|entry| entry.operator.as_str())
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(report.operators[1].call_count, 2);
        assert_eq!(report.operators[1].key_counts.get("CPU"), Some(&2));

        let encoded = encode_stats_report(&report).expect("encode");
        let decoded = decode_stats_report(&encoded).expect("decode");
        assert_eq!(decoded, report);
    }

    #[test]
    fn stats_report_rejects_unknown_schema_version() {
        let report = CallStatsReport {
            schema_version: STATS_REPORT_SCHEMA_VERSION + 1,
            operators: vec![OperatorStatsEntry {
                operator: String::from("add"),
                call_count: 1,
                key_counts: [(String::from("CPU"), 1)].into_iter().collect(),
            }],
        };
        let encoded = encode_stats_report(&report).expect("encode");
        let err = decode_stats_report(&encoded).expect_err("version check");
        assert_eq!(
            err,
            super::ReportError::SchemaVersionMismatch {
                expected: STATS_REPORT_SCHEMA_VERSION,
                actual: STATS_REPORT_SCHEMA_VERSION + 1
            }
        );
    }

    #[test]
    fn debug_string_lists_operators_and_stats() {
        let dispatcher = Dispatcher::new();
        let handle = dispatcher.register_operator("add");
        handle.set_kernel(DispatchKey::CPU, tensor_passthrough());

        dispatcher.enable_profiling(true);
        let tensor = tensor_cpu(vec![1]).expect("cpu tensor");
        dispatcher
            .call("add", &[Value::Tensor(tensor)])
            .expect("profiled call");

        let rendered = dispatcher.debug_string();
        assert!(rendered.contains("Registered operators: 1"));
        assert!(rendered.contains("add {"));
        assert!(rendered.contains("    CPU"));
        assert!(rendered.contains("add: 1 calls"));
        assert!(rendered.contains("CPU: 1 times"));
    }

    #[test]
    fn concurrent_registration_yields_one_handle() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut workers = Vec::new();
        for _ in 0..8 {
            let dispatcher = dispatcher.clone();
            workers.push(std::thread::spawn(move || {
                dispatcher.register_operator("contended")
            }));
        }
        let handles: Vec<Arc<OperatorHandle>> = workers
            .into_iter()
            .map(|worker| worker.join().expect("worker join"))
            .collect();
        for handle in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], handle));
        }
        assert_eq!(dispatcher.all_operator_names().len(), 1);
    }

    #[test]
    fn wrapper_redispatch_terminates_across_all_functionality_keys() {
        let dispatcher = Arc::new(Dispatcher::new());
        let handle = dispatcher.register_operator("wrapped");
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let full_set = DispatchKeySet::from_keys(&[
            DispatchKey::Autograd,
            DispatchKey::Tracing,
            DispatchKey::Profiling,
            DispatchKey::CPU,
        ]);
        let remaining = Arc::new(Mutex::new(full_set));

        for key in [
            DispatchKey::Autograd,
            DispatchKey::Tracing,
            DispatchKey::Profiling,
        ] {
            let dispatcher = dispatcher.clone();
            let order = order.clone();
            let remaining = remaining.clone();
            handle.set_kernel(
                key,
                KernelFunction::from_boxed(move |args| {
                    order.lock().expect("order lock").push(key.name());
                    let reduced = {
                        let mut keys = remaining.lock().expect("remaining lock");
                        keys.remove(key);
                        *keys
                    };
                    dispatcher.call_with_keys("wrapped", reduced, args)
                }),
            );
        }
        {
            let order = order.clone();
            handle.set_kernel(
                DispatchKey::CPU,
                KernelFunction::from_boxed(move |_args| {
                    order.lock().expect("order lock").push("CPU");
                    Ok(Vec::new())
                }),
            );
        }

        dispatcher
            .call_with_keys("wrapped", full_set, &[])
            .expect("stacked dispatch");

        assert_eq!(
            *order.lock().expect("order lock"),
            vec!["Autograd", "Tracing", "Profiling", "CPU"]
        );
    }

    proptest! {
        #[test]
        fn prop_boxing_round_trips_scalar_pairs(a in any::<f64>(), b in any::<f64>()) {
            let kernel = KernelFunction::from_unboxed(|x: f64, y: f64| -> f64 { x + y });
            let results = kernel
                .call_boxed(&[Value::Double(a), Value::Double(b)])
                .expect("scalar call");
            prop_assert_eq!(results.len(), 1);
            let out = results[0].to_double().expect("double result");
            prop_assert_eq!(out.to_bits(), (a + b).to_bits());
        }

        #[test]
        fn prop_arity_mismatch_is_exact(extra in 0usize..4) {
            let kernel = KernelFunction::from_unboxed(|x: i64| -> i64 { x });
            let args: Vec<Value> = (0..extra).map(|idx| Value::Int(idx as i64)).collect();
            let outcome = kernel.call_boxed(&args);
            if extra == 1 {
                prop_assert!(outcome.is_ok());
            } else {
                prop_assert_eq!(
                    outcome.expect_err("arity mismatch"),
                    DispatchError::ArityMismatch { expected: 1, got: extra }
                );
            }
        }
    }
}
