//! Preload shadowing: the allocator family under its own names.
//!
//! Loaded ahead of libc (`LD_PRELOAD`, or linked before it), these
//! definitions win the dynamic linker's symbol search for every object in
//! the process. The originals are reached through `dlsym(RTLD_NEXT, ..)`.

allocator_entry_points! {
    malloc = malloc,
    free = free,
    realloc = realloc,
    calloc = calloc,
    memalign = memalign,
    posix_memalign = posix_memalign,
    usable_size = malloc_usable_size,
}
