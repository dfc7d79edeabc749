use std::cmp::Ordering;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;
use rand::Rng;

use ext_merge::{Record, RunReader, SortError, SorterBuilder};

/// One generated test record: which user spent, and how much.
#[derive(Copy, Clone, Debug)]
struct Account {
    user_id: i32,
    balance: i32,
}

impl Record for Account {
    const SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> Self {
        Account {
            user_id: i32::decode(&bytes[..4]),
            balance: i32::decode(&bytes[4..8]),
        }
    }

    fn encode(&self, out: &mut [u8]) {
        self.user_id.encode(&mut out[..4]);
        self.balance.encode(&mut out[4..8]);
    }
}

fn account_order(left: &Account, right: &Account) -> Ordering {
    left.user_id
        .cmp(&right.user_id)
        .then_with(|| left.balance.cmp(&right.balance))
}

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let tag = arg_parser.value_of("tag").expect("value is required");
    let count: usize = arg_parser.value_of_t_or_exit("count");
    let budget = arg_parser
        .value_of("memory_limit")
        .expect("value has a default")
        .parse::<ByteSize>()
        .expect("value is pre-validated")
        .as_u64() as usize;

    let input = PathBuf::from(format!("./{}_test.data", tag));
    log::info!("generating {} records into {}", count, input.display());
    if let Err(err) = generate_input(&input, count, budget) {
        log::error!("test data generation error: {}", err);
        process::exit(1);
    }

    let sorter = match SorterBuilder::new().with_budget(budget).build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let result = match sorter.sort_by(&input, account_order) {
        Ok(result) => result,
        Err(err) => {
            log::error!("sorting error: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = verify_output(&result, count as u64, budget) {
        log::error!("result verification error: {}", err);
        process::exit(1);
    }

    log::info!("sorted {} records into {}", count, result.display());
}

/// Fills `path` with `count` random account records, batching writes through
/// a budget-sized buffer. The file is created exclusively so a repeated tag
/// does not clobber earlier data.
fn generate_input(path: &Path, count: usize, budget: usize) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    let mut file = options.open(path)?;

    let batch = (budget / Account::SIZE).max(1);
    let mut bytes = vec![0u8; batch * Account::SIZE];
    let mut rng = rand::thread_rng();

    let mut remaining = count;
    while remaining > 0 {
        let current = remaining.min(batch);
        for slot in 0..current {
            let account = Account {
                user_id: rng.gen_range(0..10_000),
                balance: rng.gen_range(0..40),
            };
            account.encode(&mut bytes[slot * Account::SIZE..(slot + 1) * Account::SIZE]);
        }
        file.write_all(&bytes[..current * Account::SIZE])?;
        remaining -= current;
        log::debug!("{} records left to generate", remaining);
    }

    file.sync_all()?;
    Ok(())
}

/// Streams the sorted result back, checking record count and ordering.
fn verify_output(path: &Path, expected: u64, budget: usize) -> Result<(), SortError> {
    let mut reader: RunReader<Account> = RunReader::open(path, budget)?;
    if reader.total() != expected {
        return Err(SortError::Precondition(format!(
            "{} holds {} records, expected {}",
            path.display(),
            reader.total(),
            expected
        )));
    }

    let mut previous: Option<Account> = None;
    while reader.has_more() {
        let current = reader.pop()?;
        if let Some(previous) = previous {
            if account_order(&previous, &current) == Ordering::Greater {
                return Err(SortError::Precondition(format!(
                    "{} is out of order at record {}",
                    path.display(),
                    reader.popped()
                )));
            }
        }
        previous = Some(current);
    }

    return Ok(());
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
    clap::App::new("ext-merge")
        .about("generates a file of random fixed-width records and sorts it")
        .arg(
            clap::Arg::new("tag")
                .help("name tag for the generated ./<tag>_test.data file")
                .required(true)
                .index(1),
        )
        .arg(
            clap::Arg::new("count")
                .help("number of records to generate")
                .required(true)
                .index(2)
                .validator(|v| match v.parse::<usize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("record count incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("memory_limit")
                .short('m')
                .long("memory-limit")
                .help("memory budget for each sorting phase")
                .takes_value(true)
                .default_value("1MiB")
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("memory limit format incorrect: {}", err)),
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
