// Kernel image entry. entry.S hands control here on the boot processor
// after switching to protected mode with the entry page tables loaded.

#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn i386_init() -> ! {
    exokern::kernel_main()
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("exokern is a bare-metal image; build it for the i686 kernel target");
}
