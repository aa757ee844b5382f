//! Maintenance tool for stores: list, copy, crop, edit, repair.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;

use tempo_store::{ops, StreamEdit};
use tempo_time::{Time, TimeInterval};

fn main() {
    env_logger::init();
    let arguments: Vec<String> = std::env::args().collect();
    match run(&arguments) {
        Ok(()) => {}
        Err(message) => {
            eprintln!("error: {message}");
            process::exit(1);
        }
    }
}

fn options() -> getopts::Options {
    let mut opts = getopts::Options::new();
    opts.optopt("n", "name", "source store name", "NAME");
    opts.optopt("p", "path", "source store path", "PATH");
    opts.optopt("o", "output-name", "destination store name", "NAME");
    opts.optopt("d", "output-path", "destination store path", "PATH");
    opts.optopt("s", "start", "interval start in 100ns ticks", "TICKS");
    opts.optopt("e", "end", "interval end in 100ns ticks", "TICKS");
    opts.optopt("t", "stream", "stream id to edit", "ID");
    opts.optmulti("x", "delete-at", "delete the message at this originating time", "TICKS");
    opts.optflag("h", "help", "print this help");
    opts
}

fn usage(opts: &getopts::Options) -> String {
    opts.usage("Usage: tempo-store <list-streams|copy|crop|edit|repair> [options]")
}

fn run(arguments: &[String]) -> Result<(), String> {
    let opts = options();
    if arguments.len() < 2 {
        return Err(usage(&opts));
    }
    let command = arguments[1].as_str();
    let matches = opts.parse(&arguments[2..]).map_err(|error| error.to_string())?;
    if matches.opt_present("h") {
        println!("{}", usage(&opts));
        return Ok(());
    }

    let name = required(&matches, "n")?;
    let path = PathBuf::from(required(&matches, "p")?);

    match command {
        "list-streams" => {
            let streams = ops::list_streams(&name, &path).map_err(|error| error.to_string())?;
            for stream in streams {
                println!(
                    "{:>4}  {:<24} {:<40} {:>10} messages",
                    stream.id, stream.name, stream.type_name, stream.message_count
                );
            }
            Ok(())
        }
        "copy" => {
            let (out_name, out_path) = destination(&matches)?;
            ops::copy_store(&name, &path, &out_name, &out_path)
                .map_err(|error| error.to_string())
        }
        "crop" => {
            let (out_name, out_path) = destination(&matches)?;
            let start = matches
                .opt_str("s")
                .map(|value| parse_ticks(&value))
                .transpose()?
                .unwrap_or(Time::MIN);
            let end = matches
                .opt_str("e")
                .map(|value| parse_ticks(&value))
                .transpose()?
                .unwrap_or(Time::MAX);
            let interval = TimeInterval::closed(start, end);
            ops::crop_store(&name, &path, &out_name, &out_path, interval)
                .map_err(|error| error.to_string())
        }
        "edit" => {
            let (out_name, out_path) = destination(&matches)?;
            let stream: u32 = required(&matches, "t")?
                .parse()
                .map_err(|_| String::from("--stream must be a stream id"))?;
            let deletes = matches.opt_strs("x");
            if deletes.is_empty() {
                return Err(String::from("edit requires at least one --delete-at"));
            }
            let mut edits = BTreeMap::new();
            edits.insert(
                stream,
                deletes
                    .iter()
                    .map(|value| parse_ticks(value).map(|time| StreamEdit::Delete { time }))
                    .collect::<Result<Vec<_>, _>>()?,
            );
            ops::edit_store(&name, &path, &out_name, &out_path, &edits)
                .map_err(|error| error.to_string())
        }
        "repair" => {
            let report = ops::repair_store(&name, &path).map_err(|error| error.to_string())?;
            println!(
                "repaired `{name}`: {} valid messages, {} entries dropped",
                report.valid_messages, report.dropped_entries
            );
            Ok(())
        }
        other => Err(format!("unknown command `{other}`\n{}", usage(&opts))),
    }
}

fn required(matches: &getopts::Matches, option: &str) -> Result<String, String> {
    matches.opt_str(option).ok_or_else(|| format!("missing required option -{option}"))
}

fn destination(matches: &getopts::Matches) -> Result<(String, PathBuf), String> {
    Ok((required(matches, "o")?, PathBuf::from(required(matches, "d")?)))
}

fn parse_ticks(value: &str) -> Result<Time, String> {
    value
        .parse::<i64>()
        .map(Time::from_ticks)
        .map_err(|_| format!("`{value}` is not a tick count"))
}
