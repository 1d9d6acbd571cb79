//! Load-time initialization, run from the ELF `.init_array`.
//!
//! Calls that arrive before this runs are still served (the resolver and the
//! code ranges initialize lazily); the constructor only moves that work out
//! of the first allocation.

#[used]
#[unsafe(link_section = ".init_array")]
static INIT: extern "C" fn() = {
    extern "C" fn mallochooks_init() {
        crate::state::init();
        // Resolve with the previous hooks still active, then take over.
        #[cfg(feature = "hook-vars")]
        crate::hookvar_abi::install();
    }
    mallochooks_init
};
