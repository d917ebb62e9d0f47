#![cfg_attr(target_os = "none", no_std, no_main)]

// Copy-on-write isolation: the parent rewrites a byte after forking;
// the child must still read the pre-fork value.

#[cfg(target_os = "none")]
mod prog {
    use core::ptr;

    use exokern::ulib::fork::fork;
    use exokern::ulib::syscall::sys_yield;
    use exokern::{ulib, upanic, uprintln};

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        ulib::libmain(umain)
    }

    fn umain() {
        let mut byte: u8 = 0xaa;
        let p = &mut byte as *mut u8;

        let child = fork();
        if child < 0 {
            upanic!("fork: {}", child);
        }

        if child == 0 {
            // Give the parent a chance to do its post-fork write first.
            sys_yield();
            sys_yield();
            let seen = unsafe { ptr::read_volatile(p) };
            if seen != 0xaa {
                upanic!("child read {:#x}, expected 0xaa", seen);
            }
            uprintln!("child sees 0xaa: copy-on-write holds");
        } else {
            unsafe { ptr::write_volatile(p, 0xbb) };
            let seen = unsafe { ptr::read_volatile(p) };
            if seen != 0xbb {
                upanic!("parent read {:#x}, expected 0xbb", seen);
            }
            uprintln!("parent sees 0xbb after its write");
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
