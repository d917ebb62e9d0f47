#![cfg_attr(target_os = "none", no_std, no_main)]

// Fork three children in sequence; each child and the parent print
// their envid, so four distinct ids reach the console.

#[cfg(target_os = "none")]
mod prog {
    use exokern::ulib::fork::fork;
    use exokern::ulib::syscall::sys_getenvid;
    use exokern::{ulib, upanic, uprintln};

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        ulib::libmain(umain)
    }

    fn umain() {
        for _ in 0..3 {
            let child = fork();
            if child == 0 {
                uprintln!("child  {:08x}", sys_getenvid());
                return;
            }
            if child < 0 {
                upanic!("fork: {}", child);
            }
        }
        uprintln!("parent {:08x}", sys_getenvid());
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
