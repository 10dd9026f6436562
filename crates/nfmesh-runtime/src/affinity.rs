//! Thread-to-CPU pinning for worker and stats threads (`spec.md` §6 "CPU
//! pinning"), translated from the `pthread_setaffinity_np` calls around
//! `socket_routine`/`worker__stats` in the original NF binaries.

/// Pin the calling thread to `cpu`. Returns `false` if the core doesn't
/// exist or the kernel refused the affinity change; callers log and carry
/// on rather than treating this as fatal.
pub fn pin_current_thread(cpu: usize) -> bool {
    let Some(cores) = core_affinity::get_core_ids() else {
        return false;
    };
    let Some(core_id) = cores.into_iter().find(|c| c.id == cpu) else {
        return false;
    };
    core_affinity::set_for_current(core_id)
}
