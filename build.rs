use std::env;

// The boot, trap-entry and user-runtime stubs are i386 assembly; they
// only belong in the bare-metal image, so host builds (tests, tooling)
// skip them entirely.
const ASM_SOURCES: &[&str] = &[
    "src/entry.S",
    "src/vectors.S",
    "src/alltraps.S",
    "src/mpentry.S",
    "src/pfentry.S",
    "src/usys.S",
];

fn main() {
    for src in ASM_SOURCES {
        println!("cargo:rerun-if-changed={}", src);
    }
    println!("cargo:rerun-if-changed=kernel.ld");

    if env::var("CARGO_CFG_TARGET_ARCH").as_deref() == Ok("x86") {
        let mut build = cc::Build::new();
        for src in ASM_SOURCES {
            build.file(src);
        }
        build.flag("-m32").compile("exokern_entry");
    }
}
