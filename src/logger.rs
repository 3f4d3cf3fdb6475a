use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Replace the default stderr sink. Passing `None` restores stderr output.
pub fn install_sink(sink: Option<LogSink>, level: Option<&str>) {
    LOGGER.install_sink(sink, level);
}

pub fn set_min_level(level: &str) {
    LOGGER.set_min_level(LogLevel::from_str(level));
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

pub type LogSink = std::sync::Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const ARP    = 0b0000_0001;
        const FLOW   = 0b0000_0010;
        const PROBE  = 0b0000_0100;
        const BACKUP = 0b0000_1000;
        const RING   = 0b0001_0000;
        const PORT   = 0b0010_0000;
        const ALL    = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

struct LogState {
    sink: Option<LogSink>,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    state: Mutex<LogState>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            state: Mutex::new(LogState {
                sink: None,
                breadcrumbs: BreadcrumbFlags::empty(),
                min_level: LogLevel::Info,
            }),
            prefix: format!("[gw-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<LogSink>, level: Option<&str>) {
        let mut state = self.state.lock();
        state.sink = sink;
        if let Some(level) = level {
            state.min_level = LogLevel::from_str(level);
        }
    }

    fn set_min_level(&self, level: LogLevel) {
        self.state.lock().min_level = level;
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        self.state.lock().breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        // Clone the sink out so it runs without the lock held; a sink that
        // logs must not deadlock.
        let sink = {
            let state = self.state.lock();
            if breadcrumbs.is_empty() {
                if level > state.min_level {
                    return;
                }
            } else if !state.breadcrumbs.intersects(breadcrumbs) {
                return;
            }
            state.sink.clone()
        };

        let formatted = if breadcrumbs.is_empty() {
            format!("{} {}", self.prefix, message)
        } else {
            format!("{} [{}] {}", self.prefix, label_for(breadcrumbs), message)
        };

        match sink {
            Some(sink) => sink(level, &formatted),
            None => eprintln!("{} {}", level.as_str(), formatted),
        }
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::FLOW) {
        "FLOW"
    } else if flags.contains(BreadcrumbFlags::ARP) {
        "ARP"
    } else if flags.contains(BreadcrumbFlags::PROBE) {
        "PROBE"
    } else if flags.contains(BreadcrumbFlags::BACKUP) {
        "BACKUP"
    } else if flags.contains(BreadcrumbFlags::RING) {
        "RING"
    } else if flags.contains(BreadcrumbFlags::PORT) {
        "PORT"
    } else {
        "LOG"
    }
}
