use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;
use rand::Rng;

use ext_mem::{
    AccessMode, JobPool, MemoryManager, ProgressIndicator, ProgressState, Sorter, Stream,
    StreamOptions,
};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let mode: Mode = arg_parser.value_of_t_or_exit("mode");

    if let Some(memory) = arg_parser.value_of("memory") {
        let budget = memory.parse::<ByteSize>().expect("value is pre-validated");
        MemoryManager::global().set_limit(budget.as_u64());
    }

    let mut options = StreamOptions::new();
    if let Some(block_size) = arg_parser.value_of("block_size") {
        let block_size = block_size.parse::<ByteSize>().expect("value is pre-validated");
        options = options.with_block_size(block_size.as_u64() as usize);
    }

    let result = match mode {
        Mode::Generate => {
            let output = arg_parser.value_of("output").expect("value is required");
            let count: u64 = arg_parser.value_of_t_or_exit("count");
            generate(options, output, count)
        }
        Mode::Sort => {
            let input = arg_parser.value_of("input").expect("value is required");
            let output = arg_parser.value_of("output").expect("value is required");
            let threads: Option<usize> = arg_parser
                .is_present("threads")
                .then(|| arg_parser.value_of_t_or_exit("threads"));
            sort(options, input, output, threads)
        }
        Mode::Dump => {
            let input = arg_parser.value_of("input").expect("value is required");
            dump(options, input)
        }
    };

    if let Err(err) = result {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn generate(options: StreamOptions, output: &str, count: u64) -> ext_mem::Result<()> {
    let mut stream: Stream<i64> = options.open(output, AccessMode::Write)?;
    let mut rng = rand::thread_rng();

    for _ in 0..count {
        stream.write_item(rng.gen())?;
    }
    stream.flush()?;

    log::info!("wrote {} records to {}", count, output);
    return Ok(());
}

fn sort(options: StreamOptions, input: &str, output: &str, threads: Option<usize>) -> ext_mem::Result<()> {
    let mut input_stream: Stream<i64> = options.clone().open(input, AccessMode::Read)?;

    let mut records = Vec::new();
    input_stream.scan(|record| records.push(*record))?;
    log::info!("read {} records from {}", records.len(), input);

    let pool = JobPool::new(threads);
    let mut progress = LogProgress::new();
    progress.push_breadcrumb("sort");
    Sorter::new().sort_by_with_progress(&mut records, i64::cmp, &mut progress, &pool);
    progress.pop_breadcrumb();

    let mut output_stream: Stream<i64> = options.open(output, AccessMode::Write)?;
    for record in records {
        output_stream.write_item(record)?;
    }
    output_stream.flush()?;

    log::info!("sorted stream written to {}", output);
    return Ok(());
}

fn dump(options: StreamOptions, input: &str) -> ext_mem::Result<()> {
    let mut stream: Stream<i64> = options.open(input, AccessMode::Read)?;
    stream.scan(|record| println!("{}", record))?;
    return Ok(());
}

/// Progress indicator that reports through the logging facade.
struct LogProgress {
    state: ProgressState,
}

impl LogProgress {
    fn new() -> Self {
        LogProgress { state: ProgressState::new() }
    }
}

impl ProgressIndicator for LogProgress {
    fn state(&self) -> &ProgressState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProgressState {
        &mut self.state
    }

    fn refresh(&mut self) {
        let range = self.state.max_range().saturating_sub(self.state.min_range());
        if range == 0 {
            return;
        }
        let percent = 100 * (self.state.current() - self.state.min_range()) / range;
        let description = self.state.description();
        if description.is_empty() {
            log::info!("{}%", percent);
        } else {
            log::info!("{}: {}%", description, percent);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Mode {
    Generate,
    Sort,
    Dump,
}

impl Mode {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Mode::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Mode as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-mem")
        .author("The ext-mem developers")
        .about("external-memory stream tool")
        .arg(
            clap::Arg::new("mode")
                .short('m')
                .long("mode")
                .help("operation to perform")
                .takes_value(true)
                .default_value("sort")
                .possible_values(Mode::possible_values()),
        )
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("input stream file")
                .takes_value(true)
                .required_if_eq_any(&[("mode", "sort"), ("mode", "dump")]),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("output stream file")
                .takes_value(true)
                .required_if_eq_any(&[("mode", "sort"), ("mode", "generate")]),
        )
        .arg(
            clap::Arg::new("count")
                .short('n')
                .long("count")
                .help("number of records to generate")
                .takes_value(true)
                .default_value("1000000"),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of worker threads for parallel sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("block_size")
                .short('b')
                .long("block-size")
                .help("stream block size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Block size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("memory")
                .long("memory")
                .help("process-wide memory budget")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Memory budget format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
