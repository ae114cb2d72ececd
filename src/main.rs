//! Undertone — command-line interface.
//!
//! Builds each script into a program and renders it to the audio
//! device and/or a WAV file:
//!   undertone [-a|-m] [-r <srate>] [-p] [-o <wavfile>] <script>...

use std::path::PathBuf;

use clap::Parser;

use undertone::audio::render_program;
use undertone::dsl::Compiler;
use undertone::program::ramp::RampShape;
use undertone::program::wave::Wave;

const DEFAULT_SRATE: u32 = 44100;

#[derive(Parser, Debug)]
#[command(
    name = "undertone",
    about = "Scriptable audio synthesizer",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    /// Audible; always enable audio device output
    #[arg(short = 'a', conflicts_with_all = ["muted", "check"])]
    audible: bool,

    /// Muted; always disable audio device output
    #[arg(short = 'm', conflicts_with_all = ["audible", "check"])]
    muted: bool,

    /// Sample rate in Hz (default 44100)
    #[arg(short = 'r', value_name = "SRATE", conflicts_with = "check")]
    srate: Option<u32>,

    /// Write a 16-bit PCM WAV file; disables audio device output by default
    #[arg(short = 'o', value_name = "WAVFILE", conflicts_with = "check")]
    wav: Option<PathBuf>,

    /// Evaluate strings instead of files
    #[arg(short = 'e')]
    eval_strings: bool,

    /// Check scripts only; parse and build without rendering
    #[arg(short = 'c')]
    check: bool,

    /// Print info for scripts after building
    #[arg(short = 'p')]
    print_info: bool,

    /// Print usage, or help for a topic (wave, ramp)
    #[arg(short = 'h', value_name = "TOPIC", num_args = 0..=1, default_missing_value = "")]
    help_topic: Option<String>,

    /// Print version
    #[arg(short = 'v')]
    show_version: bool,

    /// Script files (or strings with -e)
    scripts: Vec<String>,
}

fn print_usage(by_arg: bool) {
    let text = "\
Usage: undertone [-a|-m] [-r <srate>] [-p] [-o <wavfile>] <script>...
       undertone [-a|-m] [-r <srate>] [-p] [-o <wavfile>] -e <string>...
       undertone [-c] [-p] <script>...
       undertone [-c] [-p] -e <string>...

By default, audio device output is enabled.

  -a \tAudible; always enable audio device output.
  -m \tMuted; always disable audio device output.
  -r \tSample rate in Hz (default 44100);
     \tif unsupported for audio device, warns and uses the device rate.
  -o \tWrite a 16-bit PCM WAV file, always using the sample rate requested;
     \tdisables audio device output by default.
  -e \tEvaluate strings instead of files.
  -c \tCheck scripts only, reporting any errors or requested info.
  -p \tPrint info for scripts after loading.
  -h \tPrint this message, or help for a topic (wave, ramp).
  -v \tPrint version.";
    if by_arg {
        println!("{text}");
    } else {
        eprintln!("{text}");
    }
}

fn print_version() {
    println!("undertone v{}", env!("CARGO_PKG_VERSION"));
}

fn print_topic(topic: &str) -> bool {
    match topic {
        "wave" => {
            println!("wave types:");
            for n in Wave::NAMES {
                println!("\t{n}");
            }
            true
        }
        "ramp" => {
            println!("ramp types:");
            for n in RampShape::NAMES {
                println!("\t{n}");
            }
            true
        }
        _ => {
            eprintln!("unknown help topic '{topic}'; available are: wave, ramp");
            false
        }
    }
}

fn run(cli: Cli) -> i32 {
    if let Some(topic) = &cli.help_topic {
        if topic.is_empty() {
            print_usage(true);
        } else if !print_topic(topic) {
            print_usage(false);
        }
        return 0;
    }
    if cli.show_version {
        print_version();
        return 0;
    }
    if cli.scripts.is_empty() {
        print_usage(false);
        return 0;
    }
    let srate = cli.srate.unwrap_or(DEFAULT_SRATE);
    if srate == 0 {
        print_usage(false);
        return 0;
    }
    let use_audiodev = if cli.check || cli.muted {
        false
    } else if cli.audible {
        true
    } else {
        cli.wav.is_none()
    };

    let mut failed = false;
    for (i, arg) in cli.scripts.iter().enumerate() {
        let (source, name) = if cli.eval_strings {
            (arg.clone(), format!("string {}", i + 1))
        } else {
            match std::fs::read_to_string(arg) {
                Ok(s) => (s, arg.clone()),
                Err(e) => {
                    eprintln!("error: couldn't open script file \"{arg}\": {e}");
                    failed = true;
                    continue;
                }
            }
        };
        let prg = match Compiler::compile(&source, &name) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("error: {name}: {e}");
                failed = true;
                continue;
            }
        };
        if cli.print_info {
            println!("{}", prg.info());
        }
        if cli.check {
            continue;
        }
        if !render_program(&prg, srate, use_audiodev, cli.wav.as_deref()) {
            failed = true;
        }
    }
    if failed {
        1
    } else {
        0
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(_) => {
            // incompatible or malformed flags: print usage, do no work
            print_usage(false);
            std::process::exit(0);
        }
    };
    std::process::exit(run(cli));
}
