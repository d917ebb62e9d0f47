#![cfg_attr(target_os = "none", no_std, no_main)]

// Bounce a counter between parent and child over IPC until it hits 10.

#[cfg(target_os = "none")]
mod prog {
    use exokern::ulib::fork::fork;
    use exokern::ulib::ipc::{ipc_recv, ipc_send};
    use exokern::ulib::syscall::sys_getenvid;
    use exokern::{ulib, upanic, uprintln};

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        ulib::libmain(umain)
    }

    fn umain() {
        let who = fork();
        if who < 0 {
            upanic!("fork: {}", who);
        }

        if who != 0 {
            // Get the ball rolling.
            uprintln!("send 0 from {:08x} to {:08x}", sys_getenvid(), who);
            ipc_send(who, 0, None, 0);
        }

        loop {
            let mut from = 0;
            let val = ipc_recv(Some(&mut from), None, None);
            uprintln!("{:08x} got {} from {:08x}", sys_getenvid(), val, from);
            if val == 10 {
                return;
            }
            ipc_send(from, val as u32 + 1, None, 0);
            if val == 9 {
                return;
            }
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
