use clap::Args;

/// Configuration shared by the class loader, heap and interpreter. Built
/// once in `main` from CLI flags and passed down by reference; there is no
/// global mutable singleton.
#[derive(Debug, Clone)]
pub struct Config {
    pub main_class: String,
    pub program_args: Vec<String>,
    pub classpath: Vec<String>,
    pub heap_size: usize,
    pub log_jvm_status: bool,
    pub print_in_real_time: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            main_class: String::new(),
            program_args: vec![],
            classpath: vec![".".to_string()],
            heap_size: 65536,
            log_jvm_status: false,
            print_in_real_time: true,
        }
    }
}

/// clap-derived CLI arguments for the `run` subcommand, mirrored into a
/// `Config`.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Name of the main class to run, e.g. `com/example/Main`.
    pub class_name: String,

    /// Arguments passed through to the program's `main(String[])`.
    #[arg(trailing_var_arg = true)]
    pub program_args: Vec<String>,

    /// Classpath entries to search for `.class` files, in order. May be
    /// repeated.
    #[arg(short = 'c', long = "classpath", default_value = ".")]
    pub classpath: Vec<String>,

    /// Maximum number of heap slots before garbage collection fails fatally.
    #[arg(long = "heap-size", default_value_t = 65536)]
    pub heap_size: usize,

    /// Emit per-instruction/class-loading trace logging.
    #[arg(long = "log-jvm-status", default_value_t = false)]
    pub log_jvm_status: bool,

    /// Flush each thread's stdout output as it is produced, rather than
    /// buffering until the thread exits.
    #[arg(long = "print-in-real-time", default_value_t = true)]
    pub print_in_real_time: bool,
}

impl From<RunArgs> for Config {
    fn from(args: RunArgs) -> Self {
        Config {
            main_class: args.class_name,
            program_args: args.program_args,
            classpath: args.classpath,
            heap_size: args.heap_size,
            log_jvm_status: args.log_jvm_status,
            print_in_real_time: args.print_in_real_time,
        }
    }
}

/// Installs a `tracing` subscriber whose level is gated by
/// `log_jvm_status`: `INFO` when off (so errors/warnings still surface),
/// `TRACE` when on (full interpreter-step tracing).
pub fn init_logging(config: &Config) {
    let filter = if config.log_jvm_status {
        "trace"
    } else {
        "info"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .without_time()
        .try_init();
}
