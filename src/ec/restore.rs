use super::{Descriptor, EcCtx, Error, Result, SliceMeta, WireAction};
use crate::config::EcConf;
use crate::fs::content::WORK_EC;
use crate::hash;
use crate::lom::Lom;
use crate::transport::{self, Msg, SliceResp};
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;

/// rebuild a lost object from its slices (or a surviving replica).
///
/// the flow: broadcast a slice request to the candidate holders,
/// register a pending writer per respondent, wait with the send-file
/// bound, then either adopt a whole replica or reconstruct from any
/// `data` of the `data+parity` slices. the LOM is only written on
/// success.
pub async fn restore_object(ctx: &Arc<EcCtx>, conf: &EcConf, lom: &mut Lom) -> Result<()> {
    let uname = lom.uname();
    let peers: Vec<(String, String)> = ctx
        .smap
        .borrow()
        .hrw_targets(&uname, &ctx.daemon_id)
        .iter()
        .map(|t| (t.daemon_id.clone(), t.addr.clone()))
        .collect();

    // writers first, so an answer racing the broadcast has a home
    let mut waits = Vec::new();
    let mut to = Vec::new();
    for (daemon_id, _) in &peers {
        let key = transport::wire_uname(daemon_id, lom.bucket(), lom.objname());
        match ctx.writers.reg_writer(&key) {
            Ok(rx) => {
                waits.push((key, rx));
                to.push(daemon_id.clone());
            }
            Err(err) => log::warn!("restore '{}': {}", uname, err),
        }
    }
    if to.is_empty() {
        return Err(Error::NotEnoughSlices(uname));
    }

    let desc = Descriptor {
        action: WireAction::GetSlice,
        sender: ctx.daemon_id.clone(),
        meta: None,
        exists: false,
        is_slice: false,
    };
    let send = ctx
        .req_bundle
        .send(
            Msg {
                hdr: super::encode::header(lom, &desc)?,
                body: None,
                cb: None,
            },
            &to,
        )
        .await;
    if let Err(err) = send {
        for (key, _) in &waits {
            ctx.writers.unreg_writer(key);
        }
        return Err(err.into());
    }

    // wait on all respondents concurrently, each with its own bound
    let send_file = ctx.send_file;
    let writers = ctx.writers.clone();
    let answers = futures::future::join_all(waits.into_iter().map(|(key, rx)| {
        let writers = writers.clone();
        async move {
            match tokio::time::timeout(send_file, rx).await {
                Ok(Ok(resp)) => Some(resp),
                Ok(Err(_)) => {
                    writers.unreg_writer(&key);
                    None
                }
                Err(_) => {
                    // the late answer, if any, is dropped after drain
                    writers.unreg_writer(&key);
                    log::warn!("slice of '{}' timed out after {:?}", key, send_file);
                    None
                }
            }
        }
    }))
    .await;

    let total = conf.data_slices + conf.parity_slices;
    let mut slices: Vec<Option<Vec<u8>>> = vec![None; total];
    let mut replica: Option<(Bytes, SliceMeta)> = None;
    let mut slice_meta: Option<SliceMeta> = None;

    for resp in answers.into_iter().flatten() {
        if let Err(err) = accept(resp, &mut slices, &mut replica, &mut slice_meta) {
            log::warn!("restore '{}': bad response: {:#}", uname, err);
        }
    }

    let (content, meta) = match replica {
        Some((body, meta)) => (body.to_vec(), meta),
        None => {
            let meta = slice_meta.ok_or_else(|| Error::NotEnoughSlices(uname.clone()))?;
            let have = slices.iter().filter(|s| s.is_some()).count();
            if have < meta.data_slices {
                return Err(Error::NotEnoughSlices(uname));
            }
            let rs = ReedSolomon::new(meta.data_slices, meta.parity_slices)?;
            rs.reconstruct(&mut slices)?;

            let mut content = Vec::with_capacity(meta.obj_size as usize);
            for shard in slices.iter().take(meta.data_slices) {
                content.extend_from_slice(shard.as_ref().unwrap_or(&Vec::new()));
            }
            content.truncate(meta.obj_size as usize);
            (content, meta)
        }
    };

    write_restored(lom, content, meta).await
}

/// sort one delivered response into the replica slot or the slice
/// table, verifying its payload checksum first.
fn accept(
    resp: SliceResp,
    slices: &mut [Option<Vec<u8>>],
    replica: &mut Option<(Bytes, SliceMeta)>,
    slice_meta: &mut Option<SliceMeta>,
) -> Result<()> {
    if !resp.exists {
        return Ok(());
    }
    let desc = Descriptor::from_bytes(&resp.hdr.opaque)?;
    let meta = match desc.meta {
        Some(meta) => meta,
        None => {
            return Err(Error::CorruptedSliceMeta(
                "response without slice metadata".into(),
            ))
        }
    };

    if let Some(expect) = &meta.slice_cksum {
        let got = hash::checksum(expect.typ, &resp.body);
        if got != *expect {
            return Err(Error::CorruptedSliceMeta(format!(
                "slice {} checksum mismatch: {} != {}",
                meta.slice_id, got, expect
            )));
        }
    }

    if meta.slice_id == 0 {
        *replica = Some((resp.body, meta));
    } else if meta.slice_id <= slices.len() {
        slices[meta.slice_id - 1] = Some(resp.body.to_vec());
        *slice_meta = Some(meta);
    } else {
        return Err(Error::CorruptedSliceMeta(format!(
            "slice id {} out of range",
            meta.slice_id
        )));
    }
    Ok(())
}

/// land the restored bytes: workfile, atomic rename, then LOM persist.
async fn write_restored(lom: &mut Lom, content: Vec<u8>, meta: SliceMeta) -> Result<()> {
    let mp = lom.mpath().clone();
    let work_fqn = mp.work_fqn(lom.local(), lom.bucket(), lom.objname(), WORK_EC);
    if let Some(parent) = work_fqn.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Err(err) = tokio::fs::write(&work_fqn, &content).await {
        let _ = tokio::fs::remove_file(&work_fqn).await;
        return Err(err.into());
    }

    if let Some(parent) = lom.fqn.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Err(err) = tokio::fs::rename(&work_fqn, &lom.fqn).await {
        let _ = tokio::fs::remove_file(&work_fqn).await;
        return Err(err.into());
    }

    lom.size = meta.obj_size;
    lom.version = meta.obj_version.clone();
    lom.cksum = meta.obj_cksum.clone();
    lom.touch();
    lom.persist()?;
    Ok(())
}
