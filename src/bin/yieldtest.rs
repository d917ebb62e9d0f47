#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
mod prog {
    use exokern::ulib::syscall::{sys_getenvid, sys_yield};
    use exokern::{ulib, uprintln};

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        ulib::libmain(umain)
    }

    fn umain() {
        let me = sys_getenvid();
        uprintln!("Hello, I am environment {:08x}.", me);
        for i in 0..5 {
            sys_yield();
            uprintln!("Back in environment {:08x}, iteration {}.", me, i);
        }
        uprintln!("All done in environment {:08x}.", me);
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
