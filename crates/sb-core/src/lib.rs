#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Total number of dispatch keys, used to size dense per-key tables.
pub const NUM_DISPATCH_KEYS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatchKey {
    CPU = 0,
    CUDA = 1,
    Autograd = 2,
    Tracing = 3,
    Profiling = 4,
    Undefined = 5,
    CatchAll = 6,
}

/// Keys in ascending priority-number order (highest precedence first).
/// Functionality keys come before backend keys so wrappers run on the
/// outside; `CatchAll` is the fallback and `Undefined` is never preferred.
const PRIORITY_ORDER: [DispatchKey; NUM_DISPATCH_KEYS] = [
    DispatchKey::Autograd,
    DispatchKey::Tracing,
    DispatchKey::Profiling,
    DispatchKey::CPU,
    DispatchKey::CUDA,
    DispatchKey::CatchAll,
    DispatchKey::Undefined,
];

impl DispatchKey {
    #[must_use]
    pub const fn all() -> &'static [DispatchKey] {
        &[
            DispatchKey::CPU,
            DispatchKey::CUDA,
            DispatchKey::Autograd,
            DispatchKey::Tracing,
            DispatchKey::Profiling,
            DispatchKey::Undefined,
            DispatchKey::CatchAll,
        ]
    }

    #[must_use]
    pub const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Lower number = higher precedence.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            DispatchKey::Autograd => 0,
            DispatchKey::Tracing => 1,
            DispatchKey::Profiling => 2,
            DispatchKey::CPU => 10,
            DispatchKey::CUDA => 11,
            DispatchKey::CatchAll => 100,
            DispatchKey::Undefined => 255,
        }
    }

    #[must_use]
    pub const fn is_backend_key(self) -> bool {
        matches!(self, DispatchKey::CPU | DispatchKey::CUDA)
    }

    #[must_use]
    pub const fn is_functionality_key(self) -> bool {
        matches!(
            self,
            DispatchKey::Autograd | DispatchKey::Tracing | DispatchKey::Profiling
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            DispatchKey::CPU => "CPU",
            DispatchKey::CUDA => "CUDA",
            DispatchKey::Autograd => "Autograd",
            DispatchKey::Tracing => "Tracing",
            DispatchKey::Profiling => "Profiling",
            DispatchKey::Undefined => "Undefined",
            DispatchKey::CatchAll => "CatchAll",
        }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKeyError {
    UnknownBits { unknown_mask: u64 },
}

impl fmt::Display for DispatchKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownBits { unknown_mask } => {
                write!(f, "dispatch key set has unknown bitmask 0x{unknown_mask:016x}")
            }
        }
    }
}

impl std::error::Error for DispatchKeyError {}

/// A set of dispatch keys with constant-time membership and bitwise set
/// algebra. Enumeration order is priority order, not insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub const fn single(key: DispatchKey) -> Self {
        Self { bits: key.bit() }
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    pub fn from_bits_checked(bits: u64) -> Result<Self, DispatchKeyError> {
        let known_mask = DispatchKey::all()
            .iter()
            .fold(0u64, |mask, key| mask | key.bit());
        let unknown = bits & !known_mask;
        if unknown != 0 {
            return Err(DispatchKeyError::UnknownBits {
                unknown_mask: unknown,
            });
        }
        Ok(Self { bits })
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.bits.count_ones() as usize
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        (self.bits & key.bit()) != 0
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    pub fn remove(&mut self, key: DispatchKey) {
        self.bits &= !key.bit();
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self {
            bits: self.bits & !other.bits,
        }
    }

    /// Members in ascending priority order.
    pub fn iter(self) -> impl Iterator<Item = DispatchKey> {
        PRIORITY_ORDER.into_iter().filter(move |key| self.has(*key))
    }

    #[must_use]
    pub fn to_vec(self) -> Vec<DispatchKey> {
        self.iter().collect()
    }

    /// The priority-minimum member, or `Undefined` for the empty set.
    /// `Undefined` sorts last, so it is only returned when it is the sole
    /// member or the set is empty.
    #[must_use]
    pub fn highest_priority_key(self) -> DispatchKey {
        self.iter().next().unwrap_or(DispatchKey::Undefined)
    }
}

impl std::ops::BitOr for DispatchKeySet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for DispatchKeySet {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl std::ops::BitAnd for DispatchKeySet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl std::ops::BitAndAssign for DispatchKeySet {
    fn bitand_assign(&mut self, rhs: Self) {
        *self = self.intersection(rhs);
    }
}

impl std::ops::Sub for DispatchKeySet {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.difference(rhs)
    }
}

impl std::ops::SubAssign for DispatchKeySet {
    fn sub_assign(&mut self, rhs: Self) {
        *self = self.difference(rhs);
    }
}

impl fmt::Display for DispatchKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{")?;
        for (idx, key) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            f.write_str(key.name())?;
        }
        f.write_str("}")
    }
}

impl From<DispatchKey> for DispatchKeySet {
    fn from(key: DispatchKey) -> Self {
        Self::single(key)
    }
}

/// Process-wide functionality toggles read on every dispatch.
///
/// Toggle writes use relaxed ordering; concurrent calls see each toggle
/// eventually, and `functionality_keys` reads each toggle exactly once so a
/// single call observes one consistent snapshot.
#[derive(Debug, Default)]
pub struct DispatchState {
    autograd_enabled: AtomicBool,
    tracing_enabled: AtomicBool,
    profiling_enabled: AtomicBool,
}

static GLOBAL_DISPATCH_STATE: DispatchState = DispatchState::new();

#[must_use]
pub fn global_state() -> &'static DispatchState {
    &GLOBAL_DISPATCH_STATE
}

impl DispatchState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            autograd_enabled: AtomicBool::new(false),
            tracing_enabled: AtomicBool::new(false),
            profiling_enabled: AtomicBool::new(false),
        }
    }

    pub fn set_autograd_enabled(&self, enabled: bool) {
        self.autograd_enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_autograd_enabled(&self) -> bool {
        self.autograd_enabled.load(Ordering::Relaxed)
    }

    pub fn set_tracing_enabled(&self, enabled: bool) {
        self.tracing_enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_tracing_enabled(&self) -> bool {
        self.tracing_enabled.load(Ordering::Relaxed)
    }

    pub fn set_profiling_enabled(&self, enabled: bool) {
        self.profiling_enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_profiling_enabled(&self) -> bool {
        self.profiling_enabled.load(Ordering::Relaxed)
    }

    /// Exactly the functionality keys whose toggle is currently on.
    #[must_use]
    pub fn functionality_keys(&self) -> DispatchKeySet {
        let mut keys = DispatchKeySet::empty();
        if self.is_autograd_enabled() {
            keys.add(DispatchKey::Autograd);
        }
        if self.is_tracing_enabled() {
            keys.add(DispatchKey::Tracing);
        }
        if self.is_profiling_enabled() {
            keys.add(DispatchKey::Profiling);
        }
        keys
    }

    pub fn reset(&self) {
        self.set_autograd_enabled(false);
        self.set_tracing_enabled(false);
        self.set_profiling_enabled(false);
    }
}
