use std::{process::ExitCode, time::UNIX_EPOCH};

use clap::{Arg, ArgAction, ArgMatches, Command};
use objstore::{new_bucket, Bucket, Context, IterOption, Result};
use tracing::{error, info, span, Instrument, Level};
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("objstore")
        .about("Inspect and modify an object storage bucket")
        .arg(
            Arg::new("BUCKET")
                .help("file:///path, gs://bucket, s3://bucket or mem://")
                .required(true)
                .index(1),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("ls")
                .arg(Arg::new("PREFIX").index(1))
                .arg(
                    Arg::new("recursive")
                        .short('r')
                        .long("recursive")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("updated-at")
                        .short('u')
                        .long("updated-at")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("stat").arg(Arg::new("KEY").required(true).index(1)))
        .subcommand(Command::new("get").arg(Arg::new("KEY").required(true).index(1)))
        .subcommand(
            Command::new("put")
                .arg(Arg::new("KEY").required(true).index(1))
                .arg(Arg::new("FILE").required(true).index(2)),
        )
        .subcommand(Command::new("rm").arg(Arg::new("KEY").required(true).index(1)))
}

fn unix_secs(t: std::time::SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

async fn run(bkt: &dyn Bucket, ctx: &Context, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("ls", sub)) => {
            let prefix = sub.get_one::<String>("PREFIX").map(String::as_str).unwrap_or("");
            let mut options = Vec::new();
            if sub.get_flag("recursive") {
                options.push(IterOption::Recursive);
            }
            if sub.get_flag("updated-at") {
                options.push(IterOption::WithUpdatedAt);
            }

            bkt.iter_with_attributes(
                ctx,
                prefix,
                &mut |attrs| {
                    match attrs.last_modified() {
                        Some(t) => println!("{}\t{}", unix_secs(t), attrs.name),
                        None => println!("{}", attrs.name),
                    }
                    Ok(())
                },
                &options,
            )
            .await
        }
        Some(("stat", sub)) => {
            let key = required(sub, "KEY");
            let attrs = bkt.attributes(ctx, key).await?;
            println!(
                "{}\tsize={}\tmodified={}",
                key,
                attrs.size,
                attrs.last_modified.map(unix_secs).unwrap_or_default()
            );
            Ok(())
        }
        Some(("get", sub)) => {
            let key = required(sub, "KEY");
            let mut reader = bkt.get(ctx, key).await?;
            tokio::io::copy(&mut reader, &mut tokio::io::stdout())
                .await
                .map_err(|err| objstore::Error::from_io_source("copy", key, err))?;
            Ok(())
        }
        Some(("put", sub)) => {
            let key = required(sub, "KEY");
            let file = required(sub, "FILE");
            let mut f = tokio::fs::File::open(file)
                .await
                .map_err(|err| objstore::Error::from_io_source("open", file, err))?;
            bkt.upload(ctx, key, &mut f).await
        }
        Some(("rm", sub)) => bkt.delete(ctx, required(sub, "KEY")).await,
        _ => unreachable!("subcommand is required"),
    }
}

fn required<'a>(matches: &'a ArgMatches, id: &str) -> &'a str {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let uri = required(&matches, "BUCKET");
    let command = matches.subcommand_name().unwrap_or_default();

    let span = span!(Level::INFO, "main", context = "main", bucket = uri, command = command);

    async {
        info!("called");

        let bkt = match new_bucket(uri).await {
            Ok(bkt) => bkt,
            Err(err) => {
                error!(error_message=%err, error_group="new_bucket");
                return ExitCode::FAILURE;
            }
        };

        let ctx = Context::background();
        let cancel = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let res = run(bkt.as_ref(), &ctx, &matches).await;

        if let Err(err) = bkt.close().await {
            error!(error_message=%err, error_group="close");
        }

        match res {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(error_message=%err, error_group=command);
                ExitCode::FAILURE
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli() {
        cli().debug_assert();

        let matches = cli()
            .try_get_matches_from(["objstore", "file:///tmp/data", "ls", "blocks/", "-r"])
            .unwrap();
        assert_eq!(required(&matches, "BUCKET"), "file:///tmp/data");

        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "ls");
        assert_eq!(required(sub, "PREFIX"), "blocks/");
        assert!(sub.get_flag("recursive"));
        assert!(!sub.get_flag("updated-at"));

        assert!(cli()
            .try_get_matches_from(["objstore", "file:///tmp/data"])
            .is_err());
    }

    #[tokio::test]
    async fn test_run_put_get_rm() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, b"hello").unwrap();
        let root = dir.path().join("bucket");
        let uri = format!("file://{}", root.display());

        let bkt = new_bucket(&uri).await.unwrap();
        let ctx = Context::background();

        let src = src.display().to_string();
        let cases = vec![
            vec!["objstore", uri.as_str(), "put", "folder/key", src.as_str()],
            vec!["objstore", uri.as_str(), "stat", "folder/key"],
            vec!["objstore", uri.as_str(), "ls", "-r", "-u"],
            vec!["objstore", uri.as_str(), "rm", "folder/key"],
        ];

        for args in cases {
            let matches = cli().try_get_matches_from(args.clone()).unwrap();
            run(bkt.as_ref(), &ctx, &matches).await.unwrap_or_else(|err| {
                panic!("failed for case: {:?}, {}", args, err);
            });
        }

        assert!(!root.join("folder").exists());
    }
}
