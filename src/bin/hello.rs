#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
mod prog {
    use exokern::ulib;

    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        ulib::libmain(umain)
    }

    fn umain() {
        ulib::syscall::sys_cputs(b"hi");
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
