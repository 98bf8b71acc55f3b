use super::{Descriptor, EcCtx, Error, Result, SliceMeta, WireAction, XATTR_EC};
use crate::config::EcConf;
use crate::hash::{self, CksumType};
use crate::lom::Lom;
use crate::transport::{self, Header, Msg, ObjAttrs, SendCallback};
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;

pub(super) fn obj_attrs(lom: &Lom) -> ObjAttrs {
    let (cksum_type, cksum_value) = match &lom.cksum {
        Some(ck) => (ck.typ.to_string(), ck.value.clone()),
        None => (String::new(), String::new()),
    };
    ObjAttrs {
        size: lom.size,
        version: lom.version.clone(),
        atime_ns: lom.atime_ns,
        cksum_type,
        cksum_value,
    }
}

pub(super) fn header(lom: &Lom, desc: &Descriptor) -> Result<Header> {
    Ok(Header {
        bucket: lom.bucket().into(),
        objname: lom.objname().into(),
        attrs: obj_attrs(lom),
        opaque: desc.to_bytes()?,
    })
}

/// split an object into data+parity slices and stream them to peer
/// targets; small objects are replicated whole instead. a single peer
/// failing to take delivery does not abort the encode: parity absorbs
/// individual losses.
pub async fn encode_object(
    ctx: &Arc<EcCtx>,
    conf: &EcConf,
    lom: &Lom,
    is_copy: bool,
) -> Result<()> {
    let data = Bytes::from(tokio::fs::read(&lom.fqn).await?);
    let uname = lom.uname();
    let peers: Vec<String> = ctx
        .smap
        .borrow()
        .hrw_targets(&uname, &ctx.daemon_id)
        .iter()
        .map(|t| t.daemon_id.clone())
        .collect();

    let obj_cksum = lom
        .cksum
        .clone()
        .or_else(|| Some(hash::checksum(CksumType::Xxhash, &data)));
    let base_meta = SliceMeta {
        obj_size: lom.size,
        data_slices: conf.data_slices,
        parity_slices: conf.parity_slices,
        slice_id: 0,
        obj_version: lom.version.clone(),
        obj_cksum: obj_cksum.clone(),
        slice_cksum: None,
    };

    let delivery_log: SendCallback = Arc::new(|hdr: &Header, _body, err| {
        if let Some(err) = err {
            log::warn!(
                "slice of '{}/{}' not delivered: {:#}",
                hdr.bucket,
                hdr.objname,
                err
            );
        }
    });

    if is_copy {
        // below the size limit: full replicas on `parity` peers
        let copies = conf.parity_slices;
        if peers.len() < copies {
            return Err(Error::InsufficientTargets {
                need: conf.required_encode_targets(),
                have: peers.len() + 1,
            });
        }
        let mut meta = base_meta.clone();
        meta.slice_cksum = obj_cksum;
        let desc = Descriptor {
            action: WireAction::StoreSlice,
            sender: ctx.daemon_id.clone(),
            meta: Some(meta),
            exists: true,
            is_slice: false,
        };
        ctx.resp_bundle
            .send(
                Msg {
                    hdr: header(lom, &desc)?,
                    body: Some(data.clone()),
                    cb: Some(delivery_log),
                },
                &peers[..copies],
            )
            .await?;
    } else {
        let total = conf.data_slices + conf.parity_slices;
        if peers.len() < total {
            return Err(Error::InsufficientTargets {
                need: conf.required_encode_targets(),
                have: peers.len() + 1,
            });
        }
        let shards = split_shards(&data, conf.data_slices, conf.parity_slices)?;
        for (i, shard) in shards.into_iter().enumerate() {
            let mut meta = base_meta.clone();
            meta.slice_id = i + 1;
            meta.slice_cksum = Some(hash::checksum(CksumType::Xxhash, &shard));
            let desc = Descriptor {
                action: WireAction::StoreSlice,
                sender: ctx.daemon_id.clone(),
                meta: Some(meta),
                exists: true,
                is_slice: true,
            };
            ctx.resp_bundle
                .send(
                    Msg {
                        hdr: header(lom, &desc)?,
                        body: Some(Bytes::from(shard)),
                        cb: Some(delivery_log.clone()),
                    },
                    &[peers[i].clone()],
                )
                .await?;
        }
    }

    // remember how this object was encoded
    let buf = rmp_serde::to_vec(&base_meta).map_err(transport::Error::from)?;
    xattr::set(&lom.fqn, XATTR_EC, &buf)?;
    Ok(())
}

/// drop the local encode marker; remote slices are cleaned up by the
/// peers on the Cleanup broadcast.
pub async fn cleanup_local(lom: &Lom) -> Result<()> {
    if let Err(err) = xattr::remove(&lom.fqn, XATTR_EC) {
        log::debug!("no EC marker on '{}': {}", lom.fqn.display(), err);
    }
    Ok(())
}

/// produce data+parity shards of equal length; the tail of the last
/// data shard is zero padding, the recorded object size truncates it
/// back on restore.
pub fn split_shards(data: &[u8], d: usize, p: usize) -> Result<Vec<Vec<u8>>> {
    let shard_len = ((data.len() + d - 1) / d).max(1);
    let mut shards = Vec::with_capacity(d + p);
    for i in 0..d {
        let start = (i * shard_len).min(data.len());
        let end = ((i + 1) * shard_len).min(data.len());
        let mut shard = data[start..end].to_vec();
        shard.resize(shard_len, 0);
        shards.push(shard);
    }
    for _ in 0..p {
        shards.push(vec![0u8; shard_len]);
    }

    let rs = ReedSolomon::new(d, p)?;
    rs.encode(&mut shards)?;
    Ok(shards)
}
