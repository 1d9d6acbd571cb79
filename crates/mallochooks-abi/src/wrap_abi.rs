//! Link-time wrapping: `ld --wrap=malloc` redirects every reference to
//! `malloc` in the final link to `__wrap_malloc`, and `__real_malloc` to the
//! original definition.

allocator_entry_points! {
    malloc = __wrap_malloc,
    free = __wrap_free,
    realloc = __wrap_realloc,
    calloc = __wrap_calloc,
    memalign = __wrap_memalign,
    posix_memalign = __wrap_posix_memalign,
    usable_size = __wrap_malloc_usable_size,
}
