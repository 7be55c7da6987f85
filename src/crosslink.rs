//! The crosslinker: reflects a parsed control artifact into the relational
//! index tables (`mlink`, `plink`, `tagxref`, `event`, `attachment`,
//! `ticket`) inside a single transaction.
//!
//! The derived tables are pure functions of the artifact set; `rebuild`
//! drives this module over every artifact to regenerate them from scratch.

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use crate::errors::Result;
use crate::manifest::{parse_artifact, ArtifactKind, ControlArtifact, FileCard};
use crate::repo::Repository;
use crate::store;
use crate::tag::{
    self, tag_findid, tag_insert, tag_propagate_all, TAG_BGCOLOR, TAG_COMMENT, TAG_DATE, TAG_USER,
};

/// File permission encoding for `mlink.mperm`.
pub const PERM_REG: i64 = 0;
pub const PERM_EXE: i64 = 1;
pub const PERM_LNK: i64 = 2;

fn perm_of(f: &FileCard) -> i64 {
    if f.is_link() {
        PERM_LNK
    } else if f.is_exe() {
        PERM_EXE
    } else {
        PERM_REG
    }
}

/// Start a crosslink batch. Required when ticket artifacts may be seen, so
/// their denormalised rows can be rebuilt once at the end.
pub fn crosslink_begin(repo: &mut Repository) -> Result<()> {
    debug_assert!(!repo.crosslink_busy);
    repo.begin_transaction()?;
    repo.crosslink_busy = true;
    repo.pending_tkt.clear();
    Ok(())
}

/// Finish a crosslink batch: rebuild every queued ticket and commit.
pub fn crosslink_end(repo: &mut Repository) -> Result<()> {
    debug_assert!(repo.crosslink_busy);
    let pending = std::mem::take(&mut repo.pending_tkt);
    for uuid in pending {
        ticket_rebuild_entry(repo, &uuid)?;
    }
    repo.crosslink_busy = false;
    repo.end_transaction(false)
}

/// Abandon a crosslink batch after a failure, rolling its transaction
/// level back so the session stays balanced.
pub fn crosslink_abort(repo: &mut Repository) -> Result<()> {
    if repo.crosslink_busy {
        repo.crosslink_busy = false;
        repo.pending_tkt.clear();
        repo.end_transaction(true)?;
    }
    Ok(())
}

/// Translate a filename into an fnid, interning on first sight.
fn filename_to_fnid(repo: &Repository, name: &str) -> Result<i64> {
    let found: Option<i64> = repo
        .conn
        .query_row(
            "SELECT fnid FROM filename WHERE name=?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(fnid) = found {
        return Ok(fnid);
    }
    repo.conn
        .execute("INSERT INTO filename(name) VALUES(?1)", params![name])?;
    Ok(repo.conn.last_insert_rowid())
}

/// Add a single mlink row for one file transition, interning names and
/// resolving hashes (creating phantoms for unseen file content).
#[allow(clippy::too_many_arguments)]
fn add_one_mlink(
    repo: &mut Repository,
    mid: i64,
    pmid: i64,
    from_uuid: Option<&str>,
    to_uuid: Option<&str>,
    name: &str,
    prior_name: Option<&str>,
    mperm: i64,
) -> Result<()> {
    let fnid = filename_to_fnid(repo, name)?;
    let pfnid = match prior_name {
        Some(z) => filename_to_fnid(repo, z)?,
        None => 0,
    };
    let pid = match from_uuid {
        Some(z) => store::uuid_to_rid(repo, z, true)?,
        None => 0,
    };
    let fid = match to_uuid {
        Some(z) => store::uuid_to_rid(repo, z, true)?,
        None => 0,
    };
    repo.conn.execute(
        "INSERT INTO mlink(mid, pid, fid, fnid, pfnid, pmid, mperm, isaux) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
        params![mid, pid, fid, fnid, pfnid, pmid, mperm],
    )?;
    if pid > 0 && fid > 0 {
        // Compression hint: the older file version deltas well against the
        // newer one.
        store::deltify(repo, pid, &[fid], false)?;
    }
    Ok(())
}

/// Add the mlink rows associated with manifest `cid` whose primary parent
/// is `pid`: one row per file that changed content and/or name.
///
/// Deleted files get `fid=0`, added files `pid=0`, edits both nonzero, and
/// renames record the prior filename id.
fn add_mlink(
    repo: &mut Repository,
    pid: i64,
    parent: Option<&ControlArtifact>,
    cid: i64,
    child: Option<&ControlArtifact>,
) -> Result<()> {
    let exists: Option<i64> = repo
        .conn
        .query_row(
            "SELECT 1 FROM mlink WHERE mid=?1 LIMIT 1",
            params![cid],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Ok(());
    }
    debug_assert!(parent.is_none() || child.is_none());
    let other_rid = if parent.is_none() { pid } else { cid };
    let other = match parse_artifact(repo, other_rid) {
        Ok(m) if m.kind() == ArtifactKind::Manifest => m,
        _ => return Ok(()),
    };
    let (parent_m, child_m) = match (parent, child) {
        (Some(p), None) => (p, &other),
        (None, Some(c)) => (&other, c),
        _ => return Ok(()),
    };
    store::deltify(repo, pid, &[cid], false)?;

    let pfiles = parent_m.full_file_list(repo)?;
    let cfiles = child_m.full_file_list(repo)?;

    // Cross-link renamed files: child cards carry the prior name.
    let mut c_rename: Vec<Option<usize>> = vec![None; cfiles.len()];
    let mut p_rename: Vec<Option<usize>> = vec![None; pfiles.len()];
    for (j, cf) in cfiles.iter().enumerate() {
        if let Some(prior) = &cf.prior {
            if let Ok(i) = pfiles.binary_search_by(|pf| pf.name.as_str().cmp(prior.as_str())) {
                c_rename[j] = Some(i);
                p_rename[i] = Some(j);
            }
        }
    }

    let mut i = 0;
    let mut j = 0;
    while i < pfiles.len() && j < cfiles.len() {
        if p_rename[i].is_some() {
            // Handled when the renamed child card comes up.
            i += 1;
            continue;
        }
        match pfiles[i].name.cmp(&cfiles[j].name) {
            std::cmp::Ordering::Less => {
                add_one_mlink(
                    repo,
                    cid,
                    pid,
                    pfiles[i].uuid.as_deref(),
                    None,
                    &pfiles[i].name,
                    None,
                    PERM_REG,
                )?;
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                emit_child_card(repo, cid, pid, &pfiles, &cfiles, &c_rename, j)?;
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                if pfiles[i].uuid != cfiles[j].uuid {
                    add_one_mlink(
                        repo,
                        cid,
                        pid,
                        pfiles[i].uuid.as_deref(),
                        cfiles[j].uuid.as_deref(),
                        &cfiles[j].name,
                        None,
                        perm_of(&cfiles[j]),
                    )?;
                }
                i += 1;
                j += 1;
            }
        }
    }
    while i < pfiles.len() {
        if p_rename[i].is_none() {
            add_one_mlink(
                repo,
                cid,
                pid,
                pfiles[i].uuid.as_deref(),
                None,
                &pfiles[i].name,
                None,
                PERM_REG,
            )?;
        }
        i += 1;
    }
    while j < cfiles.len() {
        emit_child_card(repo, cid, pid, &pfiles, &cfiles, &c_rename, j)?;
        j += 1;
    }
    Ok(())
}

/// Emit the mlink row for a child-side card that has no same-name match in
/// the parent: either a rename (prior name known) or an addition.
fn emit_child_card(
    repo: &mut Repository,
    cid: i64,
    pid: i64,
    pfiles: &[FileCard],
    cfiles: &[FileCard],
    c_rename: &[Option<usize>],
    j: usize,
) -> Result<()> {
    match c_rename[j] {
        Some(i) => add_one_mlink(
            repo,
            cid,
            pid,
            pfiles[i].uuid.as_deref(),
            cfiles[j].uuid.as_deref(),
            &cfiles[j].name,
            Some(&pfiles[i].name),
            perm_of(&cfiles[j]),
        ),
        None => add_one_mlink(
            repo,
            cid,
            pid,
            None,
            cfiles[j].uuid.as_deref(),
            &cfiles[j].name,
            None,
            perm_of(&cfiles[j]),
        ),
    }
}

/// Crosslink artifact `rid` whose content is `content`.
///
/// Returns false (without error) when the content is not a control
/// artifact; syntax errors during bulk scans are expected and simply mean
/// "this is a data file". Callers that require a control artifact check
/// the return value.
pub fn crosslink(repo: &mut Repository, rid: i64, content: Vec<u8>) -> Result<bool> {
    let m = match repo.manifest_cache.find(rid) {
        Some(m) => m,
        None => match ControlArtifact::parse(content) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        },
    };
    repo.begin_transaction()?;
    let r = crosslink_inner(repo, rid, &m);
    repo.end_transaction(r.is_err())?;
    r?;
    if m.kind() == ArtifactKind::Manifest {
        repo.manifest_cache.insert(rid, m);
    }
    Ok(true)
}

fn crosslink_inner(repo: &mut Repository, rid: i64, m: &ControlArtifact) -> Result<()> {
    let mut parentid = 0i64;
    match m.kind() {
        ArtifactKind::Manifest => {
            // A delta manifest whose baseline has not arrived yet is parked
            // and replayed when the baseline dephantomizes.
            let mut baseid: Option<i64> = None;
            if let Some(bhash) = &m.baseline {
                let brid = store::uuid_to_rid(repo, bhash, true)?;
                baseid = Some(brid);
                if !store::is_available(repo, brid)? {
                    debug!(rid, baseline = brid, "parking orphan delta manifest");
                    repo.conn.execute(
                        "INSERT OR IGNORE INTO orphan(rid, baseline) VALUES(?1, ?2)",
                        params![rid, brid],
                    )?;
                    return Ok(());
                }
            }
            let linked: Option<i64> = repo
                .conn
                .query_row(
                    "SELECT 1 FROM mlink WHERE mid=?1 LIMIT 1",
                    params![rid],
                    |row| row.get(0),
                )
                .optional()?;
            if linked.is_none() {
                for (i, phash) in m.parents.iter().enumerate() {
                    let pid = store::uuid_to_rid(repo, phash, true)?;
                    repo.conn.execute(
                        "INSERT OR IGNORE INTO plink(pid, cid, isprim, mtime, baseid) \
                         VALUES(?1, ?2, ?3, ?4, ?5)",
                        params![pid, rid, i == 0, m.date, baseid],
                    )?;
                    if i == 0 {
                        add_mlink(repo, pid, None, rid, Some(m))?;
                        parentid = pid;
                    }
                }
                // Children that arrived first and already point at us.
                let kids: Vec<i64> = {
                    let mut stmt = repo
                        .conn
                        .prepare_cached("SELECT cid FROM plink WHERE pid=?1 AND isprim")?;
                    let __rows = stmt.query_map(params![rid], |row| row.get(0))?
                        .collect::<rusqlite::Result<_>>()?;
                    __rows
                };
                for cid in kids {
                    add_mlink(repo, rid, Some(m), cid, None)?;
                }
                repo.conn.execute(
                    "REPLACE INTO event(type, mtime, objid, user, comment, bgcolor, euser, ecomment) \
                     VALUES('ci', \
                       coalesce((SELECT julianday(value) FROM tagxref WHERE tagid=?1 AND rid=?2), ?3), \
                       ?2, ?4, ?5, \
                       (SELECT value FROM tagxref WHERE tagid=?6 AND rid=?2 AND tagtype>0), \
                       (SELECT value FROM tagxref WHERE tagid=?7 AND rid=?2), \
                       (SELECT value FROM tagxref WHERE tagid=?8 AND rid=?2))",
                    params![
                        TAG_DATE,
                        rid,
                        m.date,
                        m.user,
                        m.comment,
                        TAG_BGCOLOR,
                        TAG_USER,
                        TAG_COMMENT
                    ],
                )?;
            }
        }
        ArtifactKind::Cluster => {
            tag_insert(repo, "cluster", 1, None, rid, m.date, rid)?;
            for uuid in &m.cluster {
                let mid = store::uuid_to_rid(repo, uuid, true)?;
                if mid > 0 {
                    repo.conn
                        .execute("DELETE FROM unclustered WHERE rid=?1", params![mid])?;
                }
            }
        }
        ArtifactKind::Wiki => crosslink_wiki(repo, rid, m)?,
        ArtifactKind::Event => crosslink_event(repo, rid, m)?,
        ArtifactKind::Ticket => {
            let uuid = m.ticket_uuid.clone().expect("ticket has K card");
            tag_insert(repo, &format!("tkt-{uuid}"), 1, None, rid, m.date, rid)?;
            let n = m.fields.len();
            repo.conn.execute(
                "REPLACE INTO event(type, mtime, objid, tagid, user, comment) \
                 VALUES('t', ?1, ?2, \
                   (SELECT tagid FROM tag WHERE tagname='tkt-'||?3), ?4, ?5)",
                params![
                    m.date,
                    rid,
                    uuid,
                    m.user,
                    format!(
                        "Ticket [{}]: {} change{}",
                        &uuid[..10.min(uuid.len())],
                        n,
                        if n == 1 { "" } else { "s" }
                    )
                ],
            )?;
            if repo.crosslink_busy {
                if !repo.pending_tkt.contains(&uuid) {
                    repo.pending_tkt.push(uuid);
                }
            } else {
                ticket_rebuild_entry(repo, &uuid)?;
            }
        }
        ArtifactKind::Attachment => crosslink_attachment(repo, rid, m)?,
        ArtifactKind::Control => {}
    }

    if matches!(
        m.kind(),
        ArtifactKind::Control | ArtifactKind::Manifest | ArtifactKind::Event
    ) {
        for t in &m.tags {
            let tid = match &t.uuid {
                Some(z) => store::uuid_to_rid(repo, z, true)?,
                None => rid,
            };
            if tid > 0 {
                let tagtype = match t.prefix {
                    '-' => 0,
                    '+' => 1,
                    _ => 2,
                };
                tag_insert(repo, &t.name, tagtype, t.value.as_deref(), rid, m.date, tid)?;
            }
        }
        if parentid > 0 {
            tag_propagate_all(repo, parentid)?;
        }
    }
    Ok(())
}

fn crosslink_wiki(repo: &mut Repository, rid: i64, m: &ControlArtifact) -> Result<()> {
    let title = m.wiki_title.as_deref().expect("wiki has L card");
    let body = m.wiki.as_deref().unwrap_or("").trim_start();
    let tag_name = format!("wiki-{title}");
    let tagid = tag_findid(repo, &tag_name, true)?;
    tag_insert(
        repo,
        &tag_name,
        1,
        Some(&body.len().to_string()),
        rid,
        m.date,
        rid,
    )?;
    let prior: Option<i64> = repo
        .conn
        .query_row(
            "SELECT rid FROM tagxref WHERE tagid=?1 AND mtime<?2 ORDER BY mtime DESC",
            params![tagid, m.date],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(prior) = prior {
        store::deltify(repo, prior, &[rid], false)?;
    }
    let comment = if body.is_empty() {
        format!("Deleted wiki page [{title}]")
    } else {
        format!("Changes to wiki page [{title}]")
    };
    repo.conn.execute(
        "REPLACE INTO event(type, mtime, objid, user, comment, bgcolor, euser, ecomment) \
         VALUES('w', ?1, ?2, ?3, ?4, \
           (SELECT value FROM tagxref WHERE tagid=?5 AND rid=?2 AND tagtype>1), \
           (SELECT value FROM tagxref WHERE tagid=?6 AND rid=?2), \
           (SELECT value FROM tagxref WHERE tagid=?7 AND rid=?2))",
        params![m.date, rid, m.user, comment, TAG_BGCOLOR, TAG_USER, TAG_COMMENT],
    )?;
    Ok(())
}

fn crosslink_event(repo: &mut Repository, rid: i64, m: &ControlArtifact) -> Result<()> {
    let event_id = m.event_id.as_deref().expect("event has E card");
    let body = m.wiki.as_deref().unwrap_or("").trim_start();
    let tag_name = format!("event-{event_id}");
    let tagid = tag_findid(repo, &tag_name, true)?;
    tag_insert(
        repo,
        &tag_name,
        1,
        Some(&body.len().to_string()),
        rid,
        m.date,
        rid,
    )?;
    let prior: Option<i64> = repo
        .conn
        .query_row(
            "SELECT rid FROM tagxref WHERE tagid=?1 AND mtime<?2 ORDER BY mtime DESC",
            params![tagid, m.date],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(prior) = prior {
        store::deltify(repo, prior, &[rid], false)?;
        repo.conn.execute(
            "DELETE FROM event WHERE type='e' AND tagid=?1 \
             AND objid IN (SELECT rid FROM tagxref WHERE tagid=?1)",
            params![tagid],
        )?;
    }
    let subsequent: Option<i64> = repo
        .conn
        .query_row(
            "SELECT rid FROM tagxref WHERE tagid=?1 AND mtime>?2 ORDER BY mtime",
            params![tagid, m.date],
            |row| row.get(0),
        )
        .optional()?;
    match subsequent {
        Some(later) => {
            // A newer version of this technote exists; ours only serves as
            // delta fodder.
            store::deltify(repo, rid, &[later], false)?;
        }
        None => {
            repo.conn.execute(
                "REPLACE INTO event(type, mtime, objid, tagid, user, comment, bgcolor) \
                 VALUES('e', ?1, ?2, ?3, ?4, ?5, \
                   (SELECT value FROM tagxref WHERE tagid=?6 AND rid=?2))",
                params![m.event_date, rid, tagid, m.user, m.comment, TAG_BGCOLOR],
            )?;
        }
    }
    Ok(())
}

fn crosslink_attachment(repo: &mut Repository, rid: i64, m: &ControlArtifact) -> Result<()> {
    let target = m.attach_target.as_deref().expect("attachment has target");
    let name = m.attach_name.as_deref().expect("attachment has filename");
    repo.conn.execute(
        "INSERT INTO attachment(attachid, mtime, src, target, filename, comment, user) \
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            rid,
            m.date,
            m.attach_src,
            target,
            name,
            m.comment.as_deref().unwrap_or(""),
            m.user
        ],
    )?;
    repo.conn.execute(
        "UPDATE attachment SET isLatest = (mtime = \
           (SELECT max(mtime) FROM attachment WHERE target=?1 AND filename=?2)) \
         WHERE target=?1 AND filename=?2",
        params![target, name],
    )?;
    let is_ticket = crate::hash::looks_like_hash(target);
    let verb = if m.attach_src.is_some() {
        "Add attachment"
    } else {
        "Delete attachment"
    };
    let comment = if is_ticket {
        format!(
            "{verb} \"{name}\" to ticket [{}]",
            &target[..10.min(target.len())]
        )
    } else {
        format!("{verb} \"{name}\" to wiki page [{target}]")
    };
    repo.conn.execute(
        "REPLACE INTO event(type, mtime, objid, user, comment) VALUES(?1, ?2, ?3, ?4, ?5)",
        params![if is_ticket { "t" } else { "w" }, m.date, rid, m.user, comment],
    )?;
    Ok(())
}

/// Rebuild the denormalised `ticket` row for one ticket from the ordered
/// list of its change artifacts.
pub fn ticket_rebuild_entry(repo: &mut Repository, tkt_uuid: &str) -> Result<()> {
    let tagid = tag_findid(repo, &format!("tkt-{tkt_uuid}"), true)?;
    let rids: Vec<(i64, f64)> = {
        let mut stmt = repo
            .conn
            .prepare_cached("SELECT rid, mtime FROM tagxref WHERE tagid=?1 ORDER BY mtime")?;
        let __rows = stmt.query_map(params![tagid], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        __rows
    };
    let mut fields = serde_json::Map::new();
    let mut last_mtime = 0.0f64;
    for (rid, mtime) in rids {
        let m = match parse_artifact(repo, rid) {
            Ok(m) if m.kind() == ArtifactKind::Ticket => m,
            _ => continue,
        };
        last_mtime = mtime;
        for f in &m.fields {
            let new_value = if f.append {
                match fields.get(&f.name) {
                    Some(serde_json::Value::String(old)) => format!("{old}{}", f.value),
                    _ => f.value.clone(),
                }
            } else {
                f.value.clone()
            };
            fields.insert(f.name.clone(), serde_json::Value::String(new_value));
        }
    }
    repo.conn.execute(
        "REPLACE INTO ticket(tkt_uuid, tkt_mtime, fields) VALUES(?1, ?2, ?3)",
        params![
            tkt_uuid,
            last_mtime,
            serde_json::Value::Object(fields).to_string()
        ],
    )?;
    Ok(())
}
