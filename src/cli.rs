use clap::builder::PossibleValuesParser;
use clap::{command, value_parser, Arg, ArgAction, Command};
use golem::golem::allocate::AllocationKind;
use strum::VariantNames;

pub const LOGGING_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

pub fn args() -> Command {
    command!()
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("configure logging level to use")
                .value_name("LEVEL")
                .value_parser(PossibleValuesParser::new(LOGGING_LEVELS))
                .default_value(LOGGING_LEVELS[2])
                .global(true),
        )
        .subcommand(
            Command::new("nondet")
                .about("Emit instructions materializing an arbitrary bounded object tree")
                .arg(
                    Arg::new("catalog")
                        .value_name("FILE")
                        .help("JSON type/layout catalog")
                        .required(true),
                )
                .arg(
                    Arg::new("type")
                        .short('t')
                        .long("type")
                        .value_name("DESCRIPTOR")
                        .help("Root type to materialize")
                        .required(true),
                )
                .arg(
                    Arg::new("allocation")
                        .short('a')
                        .long("allocation")
                        .value_name("KIND")
                        .help("Allocation kind for the root object tree")
                        .value_parser(PossibleValuesParser::new(
                            AllocationKind::VARIANTS.iter().copied(),
                        ))
                        .default_value("local"),
                )
                .arg(
                    Arg::new("max-depth")
                        .long("max-depth")
                        .value_name("NUMBER")
                        .help("Depth bound for recursive types")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("max-array-length")
                        .long("max-array-length")
                        .value_name("NUMBER")
                        .help("Upper bound for nondeterministic array lengths")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("max-string-length")
                        .long("max-string-length")
                        .value_name("NUMBER")
                        .help("Upper bound for nondeterministic string lengths")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    Arg::new("printable")
                        .long("printable")
                        .help("Constrain string contents to printable characters")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Replay a captured value tree as deterministic instructions")
                .arg(
                    Arg::new("catalog")
                        .value_name("FILE")
                        .help("JSON type/layout catalog")
                        .required(true),
                )
                .arg(
                    Arg::new("snapshot")
                        .value_name("FILE")
                        .help("JSON snapshot value tree")
                        .required(true),
                )
                .arg(
                    Arg::new("type")
                        .short('t')
                        .long("type")
                        .value_name("DESCRIPTOR")
                        .help("Declared type of the snapshot root")
                        .required(true),
                )
                .arg(
                    Arg::new("max-array-length")
                        .long("max-array-length")
                        .value_name("NUMBER")
                        .help("Cap for arrays with nondeterministic length")
                        .value_parser(value_parser!(u32)),
                ),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
}
