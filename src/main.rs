use anyhow::{Context, Result};
use clap::ArgMatches;
use env_logger::Env;
use golem::golem::allocate::AllocationKind;
use golem::golem::catalog::Catalog;
use golem::golem::nondet::gen_nondet_object;
use golem::golem::policy::IdentityPolicy;
use golem::golem::snapshot::assign_from_snapshot;
use golem::golem::symbol::SymbolTable;
use golem::golem::{write_program, Instr, InstrBlock, ObjectFactoryOptions, Type};
use log::info;
use std::fs::File;
use std::io;
use std::str::FromStr;

mod cli;

fn main() -> Result<()> {
    let matches = cli::args().get_matches();

    let level = matches
        .get_one::<String>("verbose")
        .map(String::as_str)
        .unwrap_or("info");
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match matches.subcommand() {
        Some(("nondet", m)) => nondet(m),
        Some(("snapshot", m)) => snapshot(m),
        _ => unreachable!("a subcommand is required"),
    }
}

fn nondet(m: &ArgMatches) -> Result<()> {
    let catalog = load_catalog(expect_arg(m, "catalog"))?;
    let typ = Type::from_str(expect_arg(m, "type"))?;
    let kind = AllocationKind::from_str(expect_arg(m, "allocation"))
        .expect("allocation kind is validated by the argument parser");

    let mut options = ObjectFactoryOptions::default();
    if let Some(depth) = m.get_one::<usize>("max-depth") {
        options.max_nondet_tree_depth = *depth;
    }
    if let Some(length) = m.get_one::<u32>("max-array-length") {
        options.max_nondet_array_length = *length;
    }
    if let Some(length) = m.get_one::<u32>("max-string-length") {
        options.max_nondet_string_length = *length;
    }
    options.string_printable = m.get_flag("printable");

    let mut symbols = SymbolTable::new();
    let mut program = InstrBlock::new();
    let root = gen_nondet_object(
        &typ,
        "root_object",
        &mut program,
        true,
        kind,
        &mut symbols,
        &catalog,
        &IdentityPolicy,
        &options,
    );
    info!("materialized nondeterministic `{}` into `{}`", typ, root);

    write_program(&program, io::stdout().lock())
}

fn snapshot(m: &ArgMatches) -> Result<()> {
    let catalog = load_catalog(expect_arg(m, "catalog"))?;
    let typ = Type::from_str(expect_arg(m, "type"))?;
    let path = expect_arg(m, "snapshot");
    let file =
        File::open(path).with_context(|| format!("failed to open snapshot `{}`", path))?;
    let value: serde_json::Value = serde_json::from_reader(file)
        .with_context(|| format!("failed to parse snapshot `{}`", path))?;

    let mut options = ObjectFactoryOptions::default();
    if let Some(length) = m.get_one::<u32>("max-array-length") {
        options.max_nondet_array_length = *length;
    }

    let mut symbols = SymbolTable::new();
    let root = symbols.fresh(&options.function_id, "snapshot_root", typ.clone(), false);
    let mut program = InstrBlock::new();
    program.add(Instr::Decl {
        symbol: root.expr(),
    });
    assign_from_snapshot(
        &root.expr(),
        &value,
        &mut program,
        &mut symbols,
        &catalog,
        &options,
    )
    .with_context(|| format!("failed to replay snapshot `{}`", path))?;
    info!("replayed snapshot `{}` into `{}`", path, root.name);

    write_program(&program, io::stdout().lock())
}

fn expect_arg<'a>(m: &'a ArgMatches, arg: &str) -> &'a str {
    m.get_one::<String>(arg)
        .unwrap_or_else(|| panic!("argument \"{}\" has to be set in CLI at all times", arg))
}

fn load_catalog(path: &str) -> Result<Catalog> {
    let file = File::open(path).with_context(|| format!("failed to open catalog `{}`", path))?;
    serde_json::from_reader(file).with_context(|| format!("failed to parse catalog `{}`", path))
}
