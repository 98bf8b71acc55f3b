use super::xaction::XactRespond;
use super::{Descriptor, EcCtx, Error, Result, SliceMeta, WireAction, XATTR_EC};
use crate::fs::content::WORK_EC;
use crate::fs::{ContentType, Locality, MountpathInfo};
use crate::hash;
use crate::transport::{self, Header, Msg};
use crate::xaction::Xact;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// work items of the Respond xaction: everything peers ask of us.
pub enum RespondWork {
    /// GetSlice or Cleanup from the request stream
    Request { hdr: Header, desc: Descriptor },
    /// a slice or replica pushed on the response stream
    Store {
        hdr: Header,
        desc: Descriptor,
        body: Bytes,
    },
}

pub(super) async fn run(
    xact: Arc<XactRespond>,
    local: Locality,
    ctx: Arc<EcCtx>,
    mut rx: mpsc::Receiver<RespondWork>,
) {
    let abort = xact.chan_abort();
    let stop = xact.stop_token();

    loop {
        let work = tokio::select! {
            _ = abort.cancelled() => break,
            _ = stop.cancelled() => break,
            work = rx.recv() => match work {
                Some(work) => work,
                None => break,
            },
        };

        let out = match work {
            RespondWork::Store { hdr, desc, body } => {
                store_slice(&ctx, local, &hdr, desc, body).await
            }
            RespondWork::Request { hdr, desc } => match desc.action {
                WireAction::GetSlice => answer_slice(&ctx, local, &hdr, &desc.sender).await,
                WireAction::Cleanup => cleanup_slice(&ctx, local, &hdr).await,
                other => {
                    log::warn!("{}: unexpected request {:?}", xact.base(), other);
                    Ok(())
                }
            },
        };
        if let Err(err) = out {
            log::error!("{}: {:#}", xact.base(), err);
        }
    }
    xact.base().finish();
    log::info!("{} stopped", xact.base());
}

fn slice_fqn(mp: &MountpathInfo, local: Locality, bucket: &str, objname: &str) -> PathBuf {
    mp.make_bucket_dir(ContentType::EcSlice, local, bucket)
        .join(objname)
}

/// slices of one object always land on the same mountpath: highest
/// random weight of the object identity over the available set.
fn pick_mpath(ctx: &EcCtx, uname: &str) -> Result<Arc<MountpathInfo>> {
    ctx.mfs
        .get()
        .available
        .values()
        .max_by_key(|mp| hash::hrw_weight(uname, mp.digest))
        .cloned()
        .ok_or(Error::NoMountpaths)
}

/// persist a pushed slice: workfile, rename, metadata attribute.
async fn store_slice(
    ctx: &Arc<EcCtx>,
    local: Locality,
    hdr: &Header,
    desc: Descriptor,
    body: Bytes,
) -> Result<()> {
    let meta = desc
        .meta
        .ok_or_else(|| Error::CorruptedSliceMeta("store without slice metadata".into()))?;

    let mp = pick_mpath(ctx, &hdr.uname())?;
    let work_fqn = mp.work_fqn(local, &hdr.bucket, &hdr.objname, WORK_EC);
    let fqn = slice_fqn(&mp, local, &hdr.bucket, &hdr.objname);

    if let Some(parent) = work_fqn.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&work_fqn, &body).await?;

    if let Some(parent) = fqn.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Err(err) = tokio::fs::rename(&work_fqn, &fqn).await {
        let _ = tokio::fs::remove_file(&work_fqn).await;
        return Err(err.into());
    }

    let buf = rmp_serde::to_vec(&meta).map_err(transport::Error::from)?;
    xattr::set(&fqn, XATTR_EC, &buf)?;
    log::debug!(
        "stored slice {} of '{}' from {} on {}",
        meta.slice_id,
        hdr.uname(),
        desc.sender,
        mp.path.display()
    );
    Ok(())
}

/// return our slice/replica of the object, or exists=false. a missing
/// slice is an answer, not an error.
async fn answer_slice(
    ctx: &Arc<EcCtx>,
    local: Locality,
    hdr: &Header,
    requester: &str,
) -> Result<()> {
    for mp in ctx.mfs.get().available.values() {
        let fqn = slice_fqn(mp, local, &hdr.bucket, &hdr.objname);
        let body = match tokio::fs::read(&fqn).await {
            Ok(body) => body,
            Err(_) => continue,
        };
        let raw = xattr::get(&fqn, XATTR_EC)?.unwrap_or_default();
        let meta: SliceMeta = rmp_serde::from_slice(&raw)
            .map_err(|err| Error::CorruptedSliceMeta(err.to_string()))?;
        let is_slice = meta.slice_id != 0;
        return reply(ctx, hdr, requester, Some(meta), true, is_slice, Some(Bytes::from(body))).await;
    }
    reply(ctx, hdr, requester, None, false, false, None).await
}

/// drop our slice of a deleted object, wherever it lives.
async fn cleanup_slice(ctx: &Arc<EcCtx>, local: Locality, hdr: &Header) -> Result<()> {
    for mp in ctx.mfs.get().available.values() {
        let fqn = slice_fqn(mp, local, &hdr.bucket, &hdr.objname);
        match tokio::fs::remove_file(&fqn).await {
            Ok(()) => log::debug!("dropped slice of '{}'", hdr.uname()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

async fn reply(
    ctx: &Arc<EcCtx>,
    hdr: &Header,
    requester: &str,
    meta: Option<SliceMeta>,
    exists: bool,
    is_slice: bool,
    body: Option<Bytes>,
) -> Result<()> {
    let desc = Descriptor {
        action: WireAction::SliceResp,
        sender: ctx.daemon_id.clone(),
        meta,
        exists,
        is_slice,
    };
    ctx.resp_bundle
        .send(
            Msg {
                hdr: Header {
                    bucket: hdr.bucket.clone(),
                    objname: hdr.objname.clone(),
                    attrs: hdr.attrs.clone(),
                    opaque: desc.to_bytes()?,
                },
                body,
                cb: None,
            },
            &[requester.to_string()],
        )
        .await?;
    Ok(())
}
