//! Filesystem watcher worker
//!
//! Three independent streams observe the deployments root:
//! - creation: new top-level directories, deployed once they settle
//! - content: descriptor changes inside a repository, force-redeployed
//! - deletion: removed top-level directories, torn down
//!
//! Changes inside a directory that is still settling restart its settle
//! delay instead of redeploying it. A catch-up pass at startup deploys every
//! repository that already exists.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tracing::{debug, error, info};

use crate::deploy::identifier::Identifier;
use crate::errors::AppError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::watch::debounce::Debouncer;
use crate::watch::filter::{split_repo, top_level_name, PathFilter};
use crate::watch::source::{WatchEventKind, WatchSource, WatchStream};
use crate::workers::deployer::{DispatchResult, Dispatcher};

const STREAM_NAMES: [&str; 3] = ["creation", "content", "deletion"];

/// Watcher options
#[derive(Debug, Clone)]
pub struct Options {
    /// Deployments root
    pub root: PathBuf,

    /// Build descriptor file name
    pub descriptor_name: String,

    /// Wait after a directory appears before deploying it
    pub settle_delay: Duration,

    /// Coalescing window for descriptor changes
    pub change_debounce: Duration,

    /// Path segments ignored on top of the built-in list
    pub extra_excludes: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/srv/deployments"),
            descriptor_name: "Dockerfile.pf".to_string(),
            settle_delay: Duration::from_secs(5),
            change_debounce: Duration::from_secs(2),
            extra_excludes: Vec::new(),
        }
    }
}

/// Dispatch a deploy for every existing repository with a descriptor.
/// Returns the number of deploys queued.
pub async fn catch_up(options: &Options, dispatcher: &Dispatcher) -> Result<usize, AppError> {
    let mut queued = 0;
    for repo in Dir::new(&options.root).list_dirs().await? {
        if !File::new(repo.join(&options.descriptor_name)).exists().await {
            debug!("Catch-up: {} has no descriptor", repo.display());
            continue;
        }
        if dispatcher.dispatch_deploy(&repo, false) == DispatchResult::Queued {
            queued += 1;
        }
    }
    info!("Catch-up pass queued {} deploys", queued);
    Ok(queued)
}

/// Run the watcher until `shutdown_signal` resolves or a stream ends.
pub async fn run(
    options: &Options,
    source: Arc<dyn WatchSource>,
    dispatcher: Dispatcher,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<(), AppError> {
    let root = options.root.clone();
    if !Dir::new(&root).exists().await {
        return Err(AppError::WatchError(format!(
            "Deployments root {} is not a directory",
            root.display()
        )));
    }
    info!("Watching {}", root.display());

    // Subscribe before the catch-up pass so nothing created meanwhile is missed
    let creation = source.open(&root, false)?;
    let content = source.open(&root, true)?;
    let deletion = source.open(&root, false)?;

    catch_up(options, &dispatcher).await?;

    // New directories settle here; the content stream defers to it
    let settling = Arc::new(Debouncer::new(options.settle_delay));
    let handles = vec![
        tokio::spawn(creation_stream(
            options.clone(),
            creation,
            dispatcher.clone(),
            settling.clone(),
        )),
        tokio::spawn(content_stream(
            options.clone(),
            content,
            dispatcher.clone(),
            settling,
        )),
        tokio::spawn(deletion_stream(options.clone(), deletion, dispatcher)),
    ];
    let aborts = handles.iter().map(|h| h.abort_handle()).collect::<Vec<_>>();

    let result = tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Watcher shutting down...");
            Ok(())
        }
        (result, index, _) = select_all(handles) => {
            let name = STREAM_NAMES[index];
            match result {
                Ok(()) => error!("The {} stream ended, stopping the watcher", name),
                Err(e) => error!("The {} stream failed: {}", name, e),
            }
            Err(AppError::WatchError(format!("{} stream ended", name)))
        }
    };

    for abort in aborts {
        abort.abort();
    }
    result
}

async fn creation_stream(
    options: Options,
    mut stream: WatchStream,
    dispatcher: Dispatcher,
    settling: Arc<Debouncer>,
) {
    while let Some(event) = stream.next().await {
        if event.kind != WatchEventKind::Created {
            continue;
        }
        let Some(name) = top_level_name(&options.root, &event.path) else {
            continue;
        };
        if let Err(e) = Identifier::parse(&name) {
            debug!("Ignoring new directory: {}", e);
            continue;
        }

        let dispatcher = dispatcher.clone();
        let path = event.path.clone();
        let scheduled = settling.schedule(event.path, move || async move {
            if !Dir::new(&path).exists().await {
                debug!("{} disappeared before it settled", path.display());
                return;
            }
            dispatcher.dispatch_deploy(&path, false);
        });
        if scheduled {
            info!("New deployment directory {}", name);
        }
    }
}

async fn content_stream(
    options: Options,
    mut stream: WatchStream,
    dispatcher: Dispatcher,
    settling: Arc<Debouncer>,
) {
    let filter = PathFilter::new(&options.extra_excludes);
    let debouncer = Debouncer::new(options.change_debounce);
    let descriptor = Path::new(&options.descriptor_name);

    while let Some(event) = stream.next().await {
        if event.kind == WatchEventKind::Removed {
            continue;
        }
        let Some((repo, inner)) = split_repo(&options.root, &event.path) else {
            continue;
        };
        if filter.is_excluded(&inner) {
            continue;
        }

        // A new directory is still being filled; its settle covers this change
        if settling.touch(&repo) {
            debug!("{} is still settling", repo.display());
            continue;
        }

        if inner.as_path() != descriptor {
            debug!("Change to {} does not trigger a redeploy", event.path.display());
            continue;
        }

        let dispatcher = dispatcher.clone();
        let descriptor_path = event.path.clone();
        let repo_path = repo.clone();
        let settling = settling.clone();
        let scheduled = debouncer.schedule(repo, move || async move {
            if settling.is_pending(&repo_path) {
                debug!(
                    "{} is still settling, leaving it to the creation stream",
                    repo_path.display()
                );
                return;
            }
            if !File::new(&descriptor_path).exists().await {
                debug!("{} disappeared, not redeploying", descriptor_path.display());
                return;
            }
            dispatcher.dispatch_deploy(&repo_path, true);
        });
        if scheduled {
            info!("Descriptor changed: {}", event.path.display());
        }
    }
}

async fn deletion_stream(options: Options, mut stream: WatchStream, dispatcher: Dispatcher) {
    while let Some(event) = stream.next().await {
        if event.kind != WatchEventKind::Removed {
            continue;
        }
        let Some(name) = top_level_name(&options.root, &event.path) else {
            continue;
        };

        info!("Deployment directory {} removed", name);
        dispatcher.dispatch_cleanup(&name);
    }
}
