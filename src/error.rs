use core::fmt;

/// Everything that can go wrong when asking one of the allocators in this
/// crate for memory or handles.
///
/// `OutOfMemory` and `OutOfHandles` are resource exhaustion and may be worth
/// handling. Every other variant is a broken contract on the caller's side.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The backing allocator returned null.
    OutOfMemory { size: usize, align: usize },
    /// Growing the handle space would overflow `u32`.
    OutOfHandles,
    /// More handles were requested in one call than the capacity delta.
    RunTooLarge { requested: u32, delta: u32 },
    /// A run of zero handles was requested or freed.
    EmptyRun,
    /// Freed handles lie (partially) outside `[0, capacity)`.
    OutOfRange { first: u32, count: u32, capacity: u32 },
    /// Freed handles overlap a range that is already free, or a pool slot
    /// (`count` 1) was freed twice.
    DoubleFree { first: u32, count: u32 },
    /// A stack allocation was freed while a newer one is still live.
    OutOfOrderFree { expected: u32, found: u32 },
    /// The pointer was not handed out by this allocator.
    ForeignPointer,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AllocError::OutOfMemory { size, align } => {
                write!(f, "out of memory allocating {} bytes (align {})", size, align)
            }
            AllocError::OutOfHandles => write!(f, "handle space exhausted"),
            AllocError::RunTooLarge { requested, delta } => write!(
                f,
                "requested {} handles at once, but capacity grows by {}",
                requested, delta
            ),
            AllocError::EmptyRun => write!(f, "empty handle run"),
            AllocError::OutOfRange {
                first,
                count,
                capacity,
            } => write!(
                f,
                "handles {}..{} lie outside capacity {}",
                first,
                u64::from(first) + u64::from(count),
                capacity
            ),
            AllocError::DoubleFree { first, count } => write!(
                f,
                "{}..{} are already free",
                first,
                u64::from(first) + u64::from(count)
            ),
            AllocError::OutOfOrderFree { expected, found } => write!(
                f,
                "deallocations must be LIFO: expected allocation #{}, got #{}",
                expected, found
            ),
            AllocError::ForeignPointer => write!(f, "pointer does not belong to this allocator"),
        }
    }
}
