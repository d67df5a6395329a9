//! Destinations opened for a single downloaded file.
//!
//! A [`Saver`] owns every handle the bytes of one file are written to. With tag fan-out enabled a
//! file tagged `#cats #dogs` goes to `<peer>/cats/<name>` and `<peer>/dogs/<name>` and *not* to
//! `<peer>/<name>`; otherwise (or when every tag destination failed to open) it goes to the flat
//! peer directory. With `skip_if_exists`, a file already present under one of its tags is not
//! written anywhere else.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::config::SaveOptions;
use crate::descriptor::FileDescriptor;
use crate::fs::{BoxedWrite, Filesystem};
use crate::naming::{sanitize_component, Resolver};
use crate::source::Sink;

/// One destination file; the handle is gone once the file was closed.
pub struct Destination {
    path: PathBuf,
    handle: Option<BoxedWrite>,
}

impl Destination {
    pub fn new(path: PathBuf, handle: BoxedWrite) -> Self {
        Self {
            path,
            handle: Some(handle),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(anyhow!("cannot write to {:?}: already closed", &self.path));
        };
        handle
            .write_all(chunk)
            .await
            .with_context(|| format!("failed writing to {:?}", &self.path))
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .shutdown()
            .await
            .with_context(|| format!("failed closing {:?}", &self.path))
    }
}

/// The set of destinations for one file.
///
/// `None` means there is nothing to write (e.g. the file already exists and `skip_if_exists` is
/// set); such a saver must never be written to.
#[derive(Default)]
pub enum Saver {
    Flat(Destination),
    TagFanOut(Vec<Destination>),
    #[default]
    None,
}

impl Saver {
    /// Open the destinations for `file` according to `options`.
    ///
    /// Errors creating the peer directory or the flat destination are returned; a failing tag
    /// destination is logged and the next tag is tried. The flat directory is only used when no
    /// tag destination opened and none was skipped as already present.
    #[instrument(skip(fs, resolver, file), fields(file = %file.name, peer = file.peer_id))]
    pub async fn create(
        fs: &dyn Filesystem,
        resolver: &Resolver,
        file: &FileDescriptor,
        options: &SaveOptions,
    ) -> anyhow::Result<Self> {
        let peer_dir = PathBuf::from(sanitize_component(&file.peer_dir_name()));
        fs.create_dir_all(&peer_dir).await?;
        let name = sanitize_component(&file.name);
        if options.fan_out_by_tag && !file.tags.is_empty() {
            let mut destinations = Vec::new();
            let mut skipped = false;
            let mut seen = std::collections::HashSet::new();
            for tag in &file.tags {
                let tag_dir = peer_dir.join(sanitize_component(tag));
                if !seen.insert(tag_dir.clone()) {
                    continue;
                }
                if let Err(error) = fs.create_dir_all(&tag_dir).await {
                    tracing::warn!("skipping tag {:?}: {:#}", tag, &error);
                    continue;
                }
                match resolver
                    .create(&tag_dir, &name, options.skip_if_exists)
                    .await
                {
                    Ok(Some((path, handle))) => destinations.push(Destination::new(path, handle)),
                    Ok(None) => skipped = true,
                    Err(error) => tracing::warn!("skipping tag {:?}: {:#}", tag, &error),
                }
            }
            if !destinations.is_empty() {
                return Ok(Self::TagFanOut(destinations));
            }
            if skipped {
                tracing::debug!("{:?} already present under its tags", &name);
                return Ok(Self::None);
            }
            tracing::debug!("no tag destination available, falling back to {:?}", &peer_dir);
        }
        Ok(
            match resolver
                .create(&peer_dir, &name, options.skip_if_exists)
                .await?
            {
                Some((path, handle)) => Self::Flat(Destination::new(path, handle)),
                None => Self::None,
            },
        )
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Flat(destination) => vec![destination.path()],
            Self::TagFanOut(destinations) => destinations.iter().map(Destination::path).collect(),
            Self::None => vec![],
        }
    }

    fn take_destinations(&mut self) -> Vec<Destination> {
        match std::mem::take(self) {
            Self::Flat(destination) => vec![destination],
            Self::TagFanOut(destinations) => destinations,
            Self::None => vec![],
        }
    }

    fn destinations_mut(&mut self) -> &mut [Destination] {
        match self {
            Self::Flat(destination) => std::slice::from_mut(destination),
            Self::TagFanOut(destinations) => destinations,
            Self::None => &mut [],
        }
    }

    /// Flush and close every destination. The saver is invalid afterwards.
    ///
    /// If any destination fails to close, every destination is still closed and the saver keeps
    /// their paths so that [`Saver::remove`] can delete them.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        let mut errors = vec![];
        for destination in self.destinations_mut() {
            if let Err(error) = destination.close().await {
                errors.push(error);
            }
        }
        if !errors.is_empty() {
            return Err(anyhow!("{:?}", &errors));
        }
        *self = Self::None;
        Ok(())
    }

    /// Close and delete every destination, continuing past individual failures.
    pub async fn remove(&mut self, fs: &dyn Filesystem) -> anyhow::Result<()> {
        let mut errors = vec![];
        for destination in self.take_destinations() {
            let Destination { path, handle } = destination;
            drop(handle);
            if let Err(error) = fs.remove_file(&path).await {
                errors.push(error);
            }
        }
        if !errors.is_empty() {
            return Err(anyhow!("{:?}", &errors));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Sink for Saver {
    async fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        match self {
            Self::Flat(destination) => destination.write(chunk).await,
            Self::TagFanOut(destinations) => {
                for destination in destinations {
                    destination.write(chunk).await?;
                }
                Ok(())
            }
            Self::None => Err(anyhow!("cannot write to a saver without destinations")),
        }
    }
}
