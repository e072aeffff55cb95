use squawk_translator::classfile::DirectoryClassPath;
use squawk_translator::errors::TranslationError;
use squawk_translator::model::{ContextArenas, TranslationContext};
use squawk_translator::settings::{Settings, VmProfile};
use squawk_translator::suite::BinarySuiteEmitter;
use squawk_translator::translate;

use clap::{value_parser, Arg, ArgAction, Command};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

fn main() -> Result<(), TranslationError> {
    let matches = Command::new("Classfile to suite translator")
        .version("0.1.0")
        .author("Alec Theriault <alec.theriault@gmail.com>")
        .about("Translate Java classfiles into suite bytecode for a small embedded VM")
        .arg(
            Arg::new("classpath")
                .long("classpath")
                .value_name("PATHS")
                .required(true)
                .help("Directories to load classes from (separated like `PATH` entries)"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .value_name("DIR")
                .default_value(".")
                .value_parser(value_parser!(PathBuf))
                .help("Directory the `.suite` files are written to"),
        )
        .arg(
            Arg::new("profile")
                .long("profile")
                .value_parser(["minimal", "full"])
                .default_value("minimal")
                .help("Target VM profile (accepted classfile versions and array dimensions)"),
        )
        .arg(
            Arg::new("no-optimize-locals")
                .long("no-optimize-locals")
                .action(ArgAction::SetTrue)
                .help("Give every local its own slot instead of sharing disjoint ones"),
        )
        .arg(
            Arg::new("no-debug")
                .long("no-debug")
                .action(ArgAction::SetTrue)
                .help("Do not emit line number tables"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Log more (repeat for more detail, `RUST_LOG` takes precedence)"),
        )
        .arg(
            Arg::new("CLASSES")
                .help("Classes to translate (eg. `java/lang/Object`)")
                .required(true)
                .num_args(1..),
        )
        .get_matches();

    let default_filter = match matches.get_count("verbose") {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let profile = match matches.get_one::<String>("profile").map(String::as_str) {
        Some("full") => VmProfile::Full,
        _ => VmProfile::Minimal,
    };
    let settings = Settings {
        profile,
        optimize_locals: !matches.get_flag("no-optimize-locals"),
        emit_debug_info: !matches.get_flag("no-debug"),
        ..Settings::default()
    };

    let class_path = match matches.get_one::<String>("classpath") {
        Some(paths) => DirectoryClassPath::from_path_list(paths),
        None => DirectoryClassPath::new(vec![]),
    };
    let output = matches
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&output)?;

    let arenas = ContextArenas::new();
    let ctx = TranslationContext::new(&arenas, settings, Box::new(class_path));

    let mut failed = 0;
    for name in matches.get_many::<String>("CLASSES").into_iter().flatten() {
        let class = match ctx.type_for_class_name(name) {
            Ok(class) => class,
            Err(err) => {
                log::error!("Skipping '{}': {}", name, err);
                failed += 1;
                continue;
            }
        };

        let mut emitter = BinarySuiteEmitter::new();
        if let Err(err) = translate::translate_class(&ctx, class, &mut emitter) {
            log::error!("Skipping '{}': {}", name, err);
            failed += 1;
            continue;
        }
        write_suite(&output, name, &emitter)?;
    }

    log::info!("Statistics:\n{}", ctx.statistics);
    if failed > 0 {
        log::error!("{} classes failed to translate", failed);
        process::exit(1);
    }
    Ok(())
}

/// Write the translated class to `<output>/<class name>.suite` (with dots for slashes)
fn write_suite(
    output: &Path,
    class_name: &str,
    emitter: &BinarySuiteEmitter,
) -> Result<(), TranslationError> {
    let path = output.join(format!("{}.suite", class_name.replace('/', ".")));
    log::info!("Writing '{}'", path.display());
    let mut writer = BufWriter::new(File::create(&path)?);
    emitter.write_to(&mut writer)?;
    writer.flush()?;
    Ok(())
}
