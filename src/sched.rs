// Round-robin scheduler.

use crate::env::{self, EnvTable};
use crate::mpconfig::CpuStatus;
use crate::spinlock::MutexGuard;
use crate::{kernel_lock, mpconfig, pmap};

/// Choose a user environment to run and run it; halt the CPU when
/// nothing is runnable. Never returns to the caller: a chosen env is
/// resumed through env_run, and a halted CPU re-enters the kernel
/// through trap() on its next interrupt.
pub(crate) fn sched_yield() -> ! {
    // Search through the table for a Runnable environment in circular
    // fashion, starting just after the env this CPU was last running.
    // Never choose an env currently Running on another CPU; only its
    // own CPU can move it out of that state, and it would be resumed
    // twice.
    let mut table = env::env_table();
    match table.find_runnable() {
        Some(env_id) => env::env_run(env_id, table),
        None => sched_halt(table),
    }
}

/// Sleep until an interrupt gives this CPU something to do.
fn sched_halt(mut table: MutexGuard<'_, EnvTable>) -> ! {
    // Purely informational: with every env gone the system is dead and
    // whatever the last env leaked stays leaked; the CPUs just wait.
    if !table.any_env_alive() {
        log::info!("no runnable environments in the system!");
    }

    // No environment is running on this CPU anymore.
    mpconfig::this_cpu_mut().unset_env();
    pmap::load_kern_pgdir();

    // Flag the halt so the next trap entry on this CPU knows it must
    // re-acquire the big kernel lock (see trap()).
    mpconfig::this_cpu().exchange_status(CpuStatus::Halted);

    drop(table);
    // Release the big kernel lock as if we were "leaving" the kernel.
    kernel_lock::unlock_kernel();

    let esp0 = mpconfig::this_cpu().kstacktop();
    halt_loop(esp0.0)
}

/// Discard the current kernel stack, enable interrupts and hlt until
/// one arrives. The next trap starts over from the top of the stack.
#[cfg(target_os = "none")]
fn halt_loop(esp0: usize) -> ! {
    unsafe {
        core::arch::asm!(
            "mov ebp, 0",
            "mov esp, {esp0}",
            "push 0",
            "push 0",
            "sti",
            "2:",
            "hlt",
            "jmp 2b",
            esp0 = in(reg) esp0,
            options(noreturn),
        );
    }
}

#[cfg(not(target_os = "none"))]
fn halt_loop(_esp0: usize) -> ! {
    unreachable!("halt_loop outside the kernel image");
}

#[cfg(test)]
mod tests {
    use crate::env::testutil;
    use crate::env::{self, EnvId, EnvStatus};
    use crate::kerntest;

    #[test]
    fn picks_first_runnable_after_caller_slot() {
        kerntest::with_kernel(|| {
            let a = testutil::spawn_running(EnvId::NONE);
            let b = testutil::spawn(a);
            let c = testutil::spawn(a);
            testutil::set_status(b, EnvStatus::Runnable);
            testutil::set_status(c, EnvStatus::Runnable);

            // Caller sits in slot 0; slot 1 comes first.
            let mut table = env::env_table();
            assert_eq!(table.find_runnable(), Some(b));
        });
    }

    #[test]
    fn wraps_around_the_table() {
        kerntest::with_kernel(|| {
            let a = testutil::spawn(EnvId::NONE);
            let b = testutil::spawn(EnvId::NONE);
            testutil::set_status(a, EnvStatus::Runnable);
            // Caller is in slot 1; the only runnable env is in slot 0.
            testutil::make_current(b);

            let mut table = env::env_table();
            assert_eq!(table.find_runnable(), Some(a));
        });
    }

    #[test]
    fn falls_back_to_the_running_caller() {
        kerntest::with_kernel(|| {
            let a = testutil::spawn_running(EnvId::NONE);
            let b = testutil::spawn(a);
            let _ = b; // NotRunnable, must not be chosen

            let mut table = env::env_table();
            assert_eq!(table.find_runnable(), Some(a));
        });
    }

    #[test]
    fn never_selects_envs_running_on_other_cpus() {
        kerntest::with_kernel(|| {
            let a = testutil::spawn_running(EnvId::NONE);
            let other = testutil::spawn(a);
            // Running, but on some other CPU: not a candidate.
            testutil::set_status(other, EnvStatus::Running);

            let mut table = env::env_table();
            assert_eq!(table.find_runnable(), Some(a));
        });
    }

    #[test]
    fn reports_nothing_when_all_envs_are_parked() {
        kerntest::with_kernel(|| {
            let a = testutil::spawn(EnvId::NONE);
            let b = testutil::spawn(EnvId::NONE);
            let _ = (a, b); // both NotRunnable, no curenv on this CPU

            let mut table = env::env_table();
            assert_eq!(table.find_runnable(), None);
        });
    }

    #[test]
    fn round_robin_covers_every_runnable_env() {
        kerntest::with_kernel(|| {
            // N yielding envs: starting from each, the successor is the
            // next runnable slot, so over N picks every env is chosen.
            let envs: Vec<_> = (0..4).map(|_| testutil::spawn(EnvId::NONE)).collect();
            for &e in &envs {
                testutil::set_status(e, EnvStatus::Runnable);
            }

            let mut scheduled = std::collections::HashSet::new();
            for i in 0..4 * envs.len() {
                let pick = {
                    let mut table = env::env_table();
                    table.find_runnable().unwrap()
                };
                scheduled.insert(pick);
                // Simulate the pick running and yielding again.
                if let Some(prev) = env::cur_env() {
                    let prev_id = prev.get_env_id();
                    testutil::set_status(prev_id, EnvStatus::Runnable);
                }
                testutil::make_current(pick);
                let _ = i;
            }

            assert_eq!(scheduled.len(), envs.len(), "some env was starved");
        });
    }
}
