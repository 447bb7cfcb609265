//! castline-queue - Manage the Castline post queue
//!
//! Unix-style tool for scheduling, inspecting and cancelling posts.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libcastline::logging::LoggingConfig;
use libcastline::pipeline::ScheduleRequest;
use libcastline::platforms::PlatformRegistry;
use libcastline::types::PostStatusReport;
use libcastline::{CastlineError, Config, Database, Post, PostStatus, PublishPipeline, Result};

#[derive(Parser, Debug)]
#[command(name = "castline-queue")]
#[command(version)]
#[command(about = "Schedule, inspect and cancel posts")]
#[command(long_about = "\
castline-queue - Manage the Castline post queue

DESCRIPTION:
    castline-queue is a Unix-style tool for the Castline publishing queue.
    Posts it schedules are published by the castline-send daemon.

COMMANDS:
    schedule    Schedule a post to one or more connected profiles, or save a draft
    status      Show a post's status and every target's attempts
    cancel      Cancel a post (in-flight attempts still finish)
    list        List posts

USAGE EXAMPLES:
    # Publish in two hours to two profiles
    castline-queue schedule --team t1 --user u1 --caption \"Launch!\" \\
        --profile p-instagram --profile p-linkedin --at 2h

    # Publish as soon as the daemon polls
    castline-queue schedule --team t1 --user u1 --caption \"Now\" --profile p1

    # Save a draft; no profiles needed and nothing is published
    castline-queue schedule --team t1 --user u1 --caption \"Idea\" --draft

    # Per-target detail as JSON
    castline-queue status <POST_ID> --format json

    # Scheduled posts of one team
    castline-queue list --team t1 --status scheduled

CONFIGURATION:
    Configuration file: ~/.config/castline/config.toml

    Override with environment variables:
        CASTLINE_CONFIG    - Path to config file
        CASTLINE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad post ID, time format, profile selection, caption
        over 5000 characters, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule a post
    Schedule {
        /// Team that owns the post
        #[arg(long)]
        team: String,

        /// User creating the post
        #[arg(long)]
        user: String,

        /// Post caption
        #[arg(short, long)]
        caption: Option<String>,

        /// Social profile to publish to (repeatable)
        #[arg(short, long = "profile", value_name = "PROFILE_ID")]
        profiles: Vec<String>,

        /// Media id to attach, in display order (repeatable)
        #[arg(short, long = "media", value_name = "MEDIA_ID")]
        media: Vec<String>,

        /// When to publish (e.g. "30m", "tomorrow 9am", RFC 3339); now if omitted
        #[arg(long)]
        at: Option<String>,

        /// Save as a draft: stored with its media, never published
        #[arg(long)]
        draft: bool,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show post status with per-target detail
    Status {
        post_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a post
    Cancel { post_id: String },

    /// List posts, newest first
    List {
        /// Only posts of this team
        #[arg(long)]
        team: Option<String>,

        /// Only posts with this status (draft, scheduled, published, failed)
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of posts
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env_or(cli.verbose, "error").init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let db = Database::new(&config.database_path()).await?;
    tracing::debug!(path = %config.database_path(), "Opened database");

    // The queue tool never dispatches, so it needs no publishers
    let pipeline = PublishPipeline::new(db.clone(), PlatformRegistry::new(), &config);

    match cli.command {
        Commands::Schedule {
            team,
            user,
            caption,
            profiles,
            media,
            at,
            draft,
            format,
        } => {
            validate_format(&format)?;
            let now = Utc::now();
            let scheduled_at = at
                .as_deref()
                .map(|s| libcastline::scheduling::parse_schedule(s, now))
                .transpose()?;

            let post = pipeline
                .schedule_post(
                    ScheduleRequest {
                        team_id: team,
                        created_by: user,
                        caption,
                        media_ids: media,
                        profile_ids: profiles,
                        scheduled_at,
                        draft,
                    },
                    now.timestamp(),
                )
                .await?;

            if format == "json" {
                print_json(&serde_json::json!({
                    "id": post.id,
                    "status": post.status,
                    "scheduled_at": post.scheduled_at,
                }))?;
            } else {
                println!("{}", post.id);
            }
        }
        Commands::Status { post_id, format } => {
            validate_format(&format)?;
            let report = pipeline.get_post_status(&post_id).await?;
            if format == "json" {
                print_json(&report)?;
            } else {
                output_status_text(&report, Utc::now().timestamp());
            }
        }
        Commands::Cancel { post_id } => {
            pipeline.cancel_post(&post_id, Utc::now().timestamp()).await?;
            println!("Cancelled {}", post_id);
        }
        Commands::List {
            team,
            status,
            limit,
            format,
        } => {
            validate_format(&format)?;
            let status = status
                .as_deref()
                .map(str::parse::<PostStatus>)
                .transpose()
                .map_err(CastlineError::InvalidInput)?;

            let posts = db.list_posts(team.as_deref(), status, limit).await?;
            if format == "json" {
                print_json(&posts)?;
            } else {
                output_list_text(&posts, Utc::now().timestamp());
            }
        }
    }

    Ok(())
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(CastlineError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CastlineError::InvalidInput(format!("Could not render JSON: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn output_status_text(report: &PostStatusReport, now: i64) {
    let when = report
        .scheduled_at
        .map(|ts| format!("{} ({})", format_timestamp(ts), format_relative(now, ts)))
        .unwrap_or_else(|| "unscheduled".to_string());

    println!(
        "{} | {}{} | {}",
        report.post_id,
        report.status,
        if report.deleted { " (cancelled)" } else { "" },
        when
    );

    for target in &report.targets {
        let mut line = format!(
            "  {} | {} | {} | attempts: {}",
            target.target_id, target.social_profile_id, target.status, target.attempt_count
        );
        if let Some(next) = target.next_attempt_at {
            line.push_str(&format!(" | next: {}", format_relative(now, next)));
        }
        if let Some(id) = &target.platform_post_id {
            line.push_str(&format!(" | platform id: {}", id));
        }
        if let Some(reason) = &target.last_reason {
            line.push_str(&format!(" | last error: {}", reason));
        }
        println!("{}", line);
    }
}

fn output_list_text(posts: &[Post], now: i64) {
    for post in posts {
        let when = post
            .scheduled_at
            .map(|ts| format_relative(now, ts))
            .unwrap_or_else(|| "unscheduled".to_string());

        println!(
            "{} | {} | {} | {}",
            post.id,
            post.status,
            truncate_content(post.caption_text(), 50),
            when
        );
    }
}

/// Truncate content to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let first_line = content.lines().next().unwrap_or("");
    if first_line.chars().count() <= max_chars && first_line.len() == content.len() {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// "in 2 hours" / "5 minutes ago"
fn format_relative(now: i64, ts: i64) -> String {
    let diff = ts - now;
    let magnitude = diff.abs();

    let minutes = magnitude / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    let span = if days > 0 {
        plural(days, "day")
    } else if hours > 0 {
        plural(hours, "hour")
    } else if minutes > 0 {
        plural(minutes, "minute")
    } else {
        return if diff >= 0 { "now".to_string() } else { "just now".to_string() };
    };

    if diff >= 0 {
        format!("in {}", span)
    } else {
        format!("{} ago", span)
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{}", n, unit, if n == 1 { "" } else { "s" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_relative() {
        assert_eq!(format_relative(0, 7200), "in 2 hours");
        assert_eq!(format_relative(0, 60), "in 1 minute");
        assert_eq!(format_relative(3 * 86400, 0), "3 days ago");
        assert_eq!(format_relative(100, 110), "now");
        assert_eq!(format_relative(110, 100), "just now");
    }

    #[test]
    fn test_truncate_content() {
        assert_eq!(truncate_content("short", 50), "short");
        assert_eq!(truncate_content("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_content("line one\nline two", 50), "line one...");
    }

    #[test]
    fn test_validate_format() {
        assert!(validate_format("text").is_ok());
        assert!(validate_format("json").is_ok());
        assert!(matches!(
            validate_format("xml"),
            Err(CastlineError::InvalidInput(_))
        ));
    }
}
