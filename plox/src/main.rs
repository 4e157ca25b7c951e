use std::{fs, io, process};

use mimalloc::MiMalloc;

use plox_sys::program::{ProgramImage, ProgramModel};
use plox_sys::reporting::AsError;
use plox_sys::vm::{ExitType, VirtualMachine};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;


fn main() {
    let args: Vec<String> = std::env::args().collect();
    let options: Options = match parse_args(args) {
        Ok(Some(options)) => options,
        Ok(None) => return,
        Err(message) => {
            eprintln!("{}", message);
            process::exit(2);
        },
    };
    match run_main(options) {
        Ok(()) => {},
        Err(message) => {
            eprintln!("{}", message);
            process::exit(1);
        },
    }
}

fn run_main(options: Options) -> Result<(), String> {
    let text: String = fs::read_to_string(&options.file).map_err(|_| format!("Unable to read file '{}'", options.file))?;
    let image: ProgramImage = ProgramImage::from_ron(&text).map_err(|e| format!("Unable to parse '{}': {}", options.file, e))?;
    let program: ProgramModel = ProgramModel::new(image).map_err(|e| e.as_error())?;

    match options.mode {
        Mode::Disassembly => {
            for line in program.disassemble() {
                println!("{}", line);
            }
            Ok(())
        },
        Mode::Default => run_vm(program),
    }
}

fn run_vm(program: ProgramModel) -> Result<(), String> {
    let stdout = io::stdout();
    let mut vm = VirtualMachine::new(program, stdout);

    match vm.run_until_completion() {
        ExitType::Error(error) => Err(vm.format_error(&error)),
        _ => Ok(())
    }
}

fn parse_args(args: Vec<String>) -> Result<Option<Options>, String> {
    let mut iter = args.into_iter();
    let mut mode: Mode = Mode::Default;

    if iter.next().is_none() {
        return Err(String::from(USAGE));
    }

    for arg in iter.by_ref() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            },
            "-d" | "--disassembly" => mode = Mode::Disassembly,
            a if a.starts_with('-') => return Err(format!("Unrecognized option: '{}'\n{}", a, USAGE)),
            a => {
                let file: String = String::from(a);
                return if iter.next().is_some() {
                    Err(String::from(USAGE))
                } else {
                    Ok(Some(Options { file, mode }))
                };
            },
        }
    }
    Err(String::from(USAGE))
}

const USAGE: &str = "Usage: plox [options] <script-path>";

fn print_help() {
    println!("{}", USAGE);
    println!("Runs a compiled plox program image.");
    println!("Options:");
    println!("  -h --help         : Show this message and then exit.");
    println!("  -d --disassembly  : Dump the disassembly view instead of executing.");
}

struct Options {
    file: String,
    mode: Mode,
}

#[derive(Eq, PartialEq)]
enum Mode { Default, Disassembly }
