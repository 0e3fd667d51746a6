use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

use viewstats_core::aggregate::RunTarget;
use viewstats_core::analytics::QueryRequest;
use viewstats_core::summary::{DayRange, Dimension};

use crate::error::CliError;

#[derive(Parser, Debug)]
#[command(name = "viewstats")]
#[command(about = "Page-view pre-aggregation and range queries", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build daily summaries for a day range
    Precalc(PrecalcArgs),

    /// Query grouped counts, top lists or the performance series
    Query(QueryArgs),

    /// Check that the store is reachable
    Health,
}

#[derive(Args, Debug, Default)]
pub struct PrecalcArgs {
    /// Single day to aggregate (YYYY-MM-DD)
    #[arg(long, conflicts_with_all = ["start", "end", "days"])]
    pub day: Option<NaiveDate>,

    /// First day of an explicit range
    #[arg(long, requires = "end", conflicts_with = "days")]
    pub start: Option<NaiveDate>,

    /// Last day of an explicit range
    #[arg(long, requires = "start")]
    pub end: Option<NaiveDate>,

    /// Aggregate the last N days up to today
    #[arg(long)]
    pub days: Option<u32>,

    /// Scope to aggregate; repeat for several. Default: all scopes
    #[arg(long = "scope")]
    pub scopes: Vec<String>,

    /// Compute and report without writing
    #[arg(long)]
    pub dry_run: bool,

    /// Run without taking the recompute lock
    #[arg(long)]
    pub force: bool,

    /// Store HyperLogLog sketches instead of exact item sets
    #[arg(long)]
    pub approximate: bool,
}

impl PrecalcArgs {
    /// Without any date option the whole event history is aggregated.
    pub fn target(&self) -> Result<RunTarget, CliError> {
        if let Some(day) = self.day {
            return Ok(RunTarget::Day(day));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            let range = DayRange::new(start, end).ok_or_else(|| {
                CliError::InvalidArgs(format!("--end {end} is before --start {start}"))
            })?;
            return Ok(RunTarget::Range(range));
        }
        if let Some(days) = self.days {
            return Ok(RunTarget::LastDays(days));
        }
        Ok(RunTarget::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueryKind {
    Grouped,
    Top,
    Performance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    pub kind: QueryKind,

    /// Grouping dimension: country, user/author or content/blog
    #[arg(long, default_value = "country")]
    pub by: String,

    /// day, week, month or year back from today
    #[arg(long)]
    pub range: Option<String>,

    #[arg(long)]
    pub start_date: Option<NaiveDate>,

    #[arg(long)]
    pub end_date: Option<NaiveDate>,

    #[arg(long)]
    pub year: Option<i32>,

    /// Include only these countries; repeatable
    #[arg(long = "country")]
    pub countries: Vec<String>,

    /// Exclude these countries; repeatable
    #[arg(long = "exclude-country")]
    pub exclude_countries: Vec<String>,

    #[arg(long)]
    pub author: Option<String>,

    #[arg(long)]
    pub content_type: Option<String>,

    #[arg(long)]
    pub content: Option<String>,

    /// Force the performance bucket: day, week, month or year
    #[arg(long)]
    pub compare: Option<String>,

    /// Report days missing from the summaries
    #[arg(long)]
    pub strict: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,
}

impl QueryArgs {
    pub fn dimension(&self) -> Result<Dimension, CliError> {
        Dimension::parse(&self.by)
            .ok_or_else(|| CliError::InvalidArgs(format!("unknown dimension '{}'", self.by)))
    }

    pub fn request(&self) -> QueryRequest {
        let list = |codes: &[String]| (!codes.is_empty()).then(|| codes.to_vec());
        QueryRequest {
            range: self.range.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            year: self.year,
            country_codes: list(&self.countries),
            exclude_country_codes: list(&self.exclude_countries),
            author: self.author.clone(),
            content_type: self.content_type.clone(),
            content_id: self.content.clone(),
            compare: self.compare.clone(),
            strict: self.strict,
        }
    }
}
