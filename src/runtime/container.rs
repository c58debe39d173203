//! Container-image invocation of a connector.
//!
//! Wraps [`super::process::run`] with the `docker run` plumbing: caller
//! documents are written to host temp files and bind-mounted into the
//! container at `/tmp/<filename>`.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::Write;

use anyhow::Context;
use tokio::process::ChildStdin;
use tokio_util::sync::CancellationToken;

use super::framing::RecordSink;

/// Host-side temp files backing the container's `/tmp` mounts. Dropping the
/// guard removes the files, so it must outlive the child process.
struct TempMounts {
    files: Vec<tempfile::NamedTempFile>,
}

/// Build the `docker run` argv for `image`, mounting each of `temp_files`
/// (filename → JSON bytes) read-only into the container.
fn build_argv(
    image: &str,
    args: &[String],
    temp_files: &BTreeMap<String, bytes::Bytes>,
) -> anyhow::Result<(Vec<String>, TempMounts)> {
    let mut argv = vec![
        "docker".to_string(),
        "run".to_string(),
        "--interactive".to_string(),
        "--rm".to_string(),
    ];
    let mut mounts = TempMounts { files: Vec::new() };

    for (name, content) in temp_files {
        let mut file = tempfile::NamedTempFile::new()
            .with_context(|| format!("creating temp file for {name}"))?;
        file.write_all(content)
            .and_then(|()| file.flush())
            .with_context(|| format!("writing temp file for {name}"))?;

        let host_path = file
            .path()
            .to_str()
            .context("temp file path is not UTF-8")?
            .to_string();
        argv.push("--mount".to_string());
        argv.push(format!(
            "type=bind,source={host_path},target=/tmp/{name},readonly"
        ));
        mounts.files.push(file);
    }

    argv.push(image.to_string());
    argv.extend(args.iter().cloned());
    Ok((argv, mounts))
}

/// Invoke connector `image` with `args`, exposing `temp_files` inside the
/// container. Semantics otherwise match [`super::process::run`]; the `docker`
/// CLI owns SIGTERM propagation into the container and its kill-timeout
/// escalation.
pub async fn run_image<P, Fut, S>(
    cancel: &CancellationToken,
    image: &str,
    args: &[String],
    temp_files: BTreeMap<String, bytes::Bytes>,
    stdin_producer: P,
    stdout_sink: S,
) -> anyhow::Result<()>
where
    P: FnOnce(ChildStdin) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: RecordSink + 'static,
{
    let (argv, mounts) = build_argv(image, args, &temp_files)?;
    let result = super::process::run(cancel, &argv, stdin_producer, stdout_sink).await;
    drop(mounts);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_mounts_every_temp_file() {
        let files = BTreeMap::from([
            ("config.json".to_string(), bytes::Bytes::from(r#"{"a":1}"#)),
            ("state.json".to_string(), bytes::Bytes::from("{}")),
        ]);
        let (argv, mounts) = build_argv(
            "ghcr.io/acme/source-http:dev",
            &["capture".to_string()],
            &files,
        )
        .unwrap();

        assert_eq!(&argv[..4], &["docker", "run", "--interactive", "--rm"]);
        assert_eq!(argv[argv.len() - 2], "ghcr.io/acme/source-http:dev");
        assert_eq!(argv[argv.len() - 1], "capture");

        let mount_args: Vec<&String> = argv.iter().filter(|a| a.contains("type=bind")).collect();
        assert_eq!(mount_args.len(), 2);
        assert!(mount_args[0].contains("target=/tmp/config.json"));
        assert!(mount_args[0].ends_with(",readonly"));
        assert!(mount_args[1].contains("target=/tmp/state.json"));

        // The host files exist with the given contents until the guard drops.
        let paths: Vec<std::path::PathBuf> =
            mounts.files.iter().map(|f| f.path().to_path_buf()).collect();
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), r#"{"a":1}"#);
        drop(mounts);
        assert!(!paths[0].exists());
        assert!(!paths[1].exists());
    }
}
