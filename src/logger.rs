// Console-backed implementation of the `log` facade. The kernel's
// diagnostic output goes through log macros; println! is reserved for
// output user environments asked for (sys_cputs) and the trap-frame
// dumps.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLog;

static KERNEL_LOG: KernelLog = KernelLog;

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "E",
            Level::Warn => "W",
            Level::Info => "I",
            Level::Debug => "D",
            Level::Trace => "T",
        };
        println!("[{} {}] {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

pub(crate) fn init() {
    if log::set_logger(&KERNEL_LOG).is_ok() {
        let level = if cfg!(feature = "debug") {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        log::set_max_level(level);
    }
}
