use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

/// Stale-while-revalidate cache for dashboard aggregates
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum TracingFormat {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Listen for view refreshes and keep the cache in sync (default)
    Listen,
    /// Report materialized view health and exit
    Health,
    /// Print velocity metrics for one student
    Velocity { user_id: String },
    /// Print completion funnel for one assignment
    Funnel { assignment_id: String },
    /// Print daily activity rollups for a school over an inclusive date range
    Rollups {
        school_id: String,
        start: NaiveDate,
        end: NaiveDate,
    },
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_listen() {
        let args = Args::try_parse_from(["metrics-cache"]).unwrap();
        assert!(args.command.is_none());
    }

    #[test]
    fn rollups_parses_dates() {
        let args = Args::try_parse_from([
            "metrics-cache",
            "--tracing",
            "json",
            "rollups",
            "school-1",
            "2025-01-01",
            "2025-01-07",
        ])
        .unwrap();
        assert!(matches!(args.tracing, TracingFormat::Json));
        match args.command {
            Some(Command::Rollups {
                school_id,
                start,
                end,
            }) => {
                assert_eq!(school_id, "school-1");
                assert_eq!(start, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
                assert_eq!(end, NaiveDate::from_ymd_opt(2025, 1, 7).unwrap());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn invalid_date_is_rejected() {
        assert!(Args::try_parse_from(["metrics-cache", "rollups", "s", "2025-13-01", "2025-01-02"]).is_err());
    }
}
