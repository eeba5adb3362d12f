use std::process::ExitCode;

use clap::Parser;

use config::{Config, RunArgs};

mod class;
mod classfile;
mod classloader;
mod config;
mod descriptor;
mod error;
mod exception;
mod frame;
mod gc;
mod heap;
mod intrinsics;
mod opcode;
mod thread;
mod value;

#[derive(Debug, clap::Parser)]
#[command(name = "matebabe", about = "A JVM bytecode interpreter")]
struct Cli {
    #[command(flatten)]
    run: RunArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config: Config = cli.run.into();
    config::init_logging(&config);

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Builds a `ClassLoader` and main thread from `config`, loads the
/// requested class and runs its `main(String[])` to completion.
fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut class_loader = classloader::ClassLoader::new(config);
    class_loader.ensure_class(&config.main_class)?;

    let args_array = build_args_array(&mut class_loader, &config.program_args)?;

    let descriptor = descriptor::parse_method_descriptor("([Ljava/lang/String;)V")?;
    let mut thread = thread::Thread::new(config.print_in_real_time);
    thread.invoke(&mut class_loader, &config.main_class, "main", &descriptor, vec![value::Slot::Ref(args_array)])?;
    Ok(())
}

/// Allocates the `String[]` passed to `main`, interning each command-line
/// argument into the VM's own heap via the class loader's compact-string
/// encoding.
fn build_args_array(
    class_loader: &mut classloader::ClassLoader,
    program_args: &[String],
) -> Result<value::Reference, Box<dyn std::error::Error>> {
    class_loader.ensure_class("java/lang/String")?;
    let array = class_loader
        .heap
        .allocate_array(descriptor::FieldType::ClassInstance("java/lang/String".to_string()), program_args.len())?;
    for (i, arg) in program_args.iter().enumerate() {
        let interned = class_loader.intern_string(arg)?;
        class_loader.heap.get_mut(array)?.data[i] = value::Slot::Ref(interned);
    }
    Ok(array)
}
