//! Strict parser for control artifacts: manifests (check-ins), clusters,
//! tag controls, wiki pages, tickets, attachments and events.
//!
//! The format is line-oriented. Each card is one line of single-space
//! separated tokens whose first token is a single upper-case letter; cards
//! must occur in lexicographic order by that letter (repeats allowed where
//! the grammar repeats a card). The `W` card is the one exception: its byte
//! count is followed by that many raw bytes plus a newline. The whole file
//! may be wrapped in a PGP clear-sign envelope, which is skipped.
//!
//! This parser is strict. The format must match exactly or the artifact is
//! rejected with the offending line number, which minimizes the risk of a
//! content file being mistaken for a control artifact just because it looks
//! similar.

use std::str::FromStr;

use crate::errors::{RepoError, Result};
use crate::hash::looks_like_hash;
use crate::repo::Repository;
use crate::store;
use crate::utils::{defossilize, is_simple_pathname, parse_card_date};

/// Discriminates the seven control-artifact variants. The numeric order
/// matches the classification precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Manifest = 1,
    Cluster = 2,
    Control = 3,
    Wiki = 4,
    Ticket = 5,
    Attachment = 6,
    Event = 7,
}

impl ArtifactKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Manifest => "manifest",
            ArtifactKind::Cluster => "cluster",
            ArtifactKind::Control => "control",
            ArtifactKind::Wiki => "wiki",
            ArtifactKind::Ticket => "ticket",
            ArtifactKind::Attachment => "attachment",
            ArtifactKind::Event => "event",
        }
    }
}

/// One `F` card: a file in a manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileCard {
    pub name: String,
    /// Absent on delta-manifest cards that delete the baseline file.
    pub uuid: Option<String>,
    /// Raw permission column: "" regular, "x" executable, "l" symlink.
    pub perm: String,
    /// Previous name when the file was renamed in this check-in.
    pub prior: Option<String>,
}

impl FileCard {
    pub fn is_exe(&self) -> bool {
        self.perm.contains('x')
    }
    pub fn is_link(&self) -> bool {
        self.perm.contains('l')
    }
}

/// One `T` card: create or cancel a tag or property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagCard {
    /// `+` singleton, `*` propagating, `-` cancel.
    pub prefix: char,
    /// Name without the prefix.
    pub name: String,
    /// Target artifact; `None` means "self".
    pub uuid: Option<String>,
    pub value: Option<String>,
}

/// One `J` card: a ticket field change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldCard {
    pub name: String,
    /// True when the J name began with `+` (append to prior value).
    pub append: bool,
    pub value: String,
}

/// One `Q` card: cherrypick (+) or backout (-) record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CherrypickCard {
    /// '+' for cherrypick, '-' for backout.
    pub sign: char,
    pub target: String,
    pub baseline: Option<String>,
}

/// A parsed control artifact. Parsing owns the input buffer; fields are
/// decoded (de-fossilized) copies.
#[derive(Clone, Debug, Default)]
pub struct ControlArtifact {
    pub kind: Option<ArtifactKind>,
    /// Decoded comment, the C card.
    pub comment: Option<String>,
    /// Julian day from the D card; 0.0 if absent.
    pub date: f64,
    /// Login from the U card.
    pub user: Option<String>,
    /// MD5 of the baseline repository content, the R card.
    pub repo_cksum: Option<String>,
    /// Baseline manifest hash for delta manifests, the B card.
    pub baseline: Option<String>,
    /// Wiki body, the W card payload.
    pub wiki: Option<String>,
    /// Wiki page title, the L card.
    pub wiki_title: Option<String>,
    /// Julian day of the event, the E card.
    pub event_date: f64,
    /// Event identifier, the E card.
    pub event_id: Option<String>,
    /// Ticket identifier, the K card.
    pub ticket_uuid: Option<String>,
    /// Mimetype, the N card.
    pub mimetype: Option<String>,
    /// A card: filename, target, optional source hash.
    pub attach_name: Option<String>,
    pub attach_target: Option<String>,
    pub attach_src: Option<String>,
    pub files: Vec<FileCard>,
    pub parents: Vec<String>,
    /// M cards in a cluster.
    pub cluster: Vec<String>,
    pub tags: Vec<TagCard>,
    pub fields: Vec<FieldCard>,
    pub cherrypicks: Vec<CherrypickCard>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    line_no: usize,
}

impl<'a> Cursor<'a> {
    fn next_line(&mut self) -> Option<&'a [u8]> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let end = memchr::memchr(b'\n', rest)?;
        self.pos += end + 1;
        self.line_no += 1;
        Some(&rest[..end])
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return None;
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }
}

fn syntax(line: usize, detail: impl Into<String>) -> RepoError {
    RepoError::ManifestSyntax {
        line,
        detail: detail.into(),
    }
}

/// Tokens of a card line after the card letter, split on single spaces.
/// Empty tokens (doubled spaces, trailing space) are rejected upstream by
/// returning an empty string the card handlers refuse.
fn tokens(line: &[u8]) -> Vec<&str> {
    if line.len() <= 2 {
        return Vec::new();
    }
    line[2..]
        .split(|b| *b == b' ')
        .map(|t| std::str::from_utf8(t).unwrap_or(""))
        .collect()
}

fn want_hash(z: &str, line: usize) -> Result<String> {
    if looks_like_hash(z) {
        Ok(z.to_string())
    } else {
        Err(syntax(line, format!("`{z}` is not a hash")))
    }
}

fn is_md5_hex(z: &str) -> bool {
    z.len() == 32 && z.bytes().all(|c| c.is_ascii_hexdigit())
}

impl ControlArtifact {
    /// Parse `content` into a control artifact, verifying the Z-card
    /// checksum and every per-variant constraint. The buffer is consumed.
    pub fn parse(content: Vec<u8>) -> Result<ControlArtifact> {
        let mut p = ControlArtifact::default();
        let mut cur = Cursor {
            data: &content,
            pos: 0,
            line_no: 0,
        };
        let mut md5 = md5::Context::new();
        let mut prev_type = 0u8;
        let mut seen_header = false;
        let mut seen_z = false;

        while let Some(mut line) = cur.next_line() {
            if line.first() == Some(&b'-') {
                if !line.starts_with(b"-----BEGIN PGP ") {
                    return Err(syntax(cur.line_no, "unrecognized line"));
                }
                if seen_header {
                    // Signature trailer terminates parsing.
                    break;
                }
                // Skip the armor header block up to the first blank line.
                loop {
                    match cur.next_line() {
                        Some(l) if !l.is_empty() => continue,
                        _ => break,
                    }
                }
                line = match cur.next_line() {
                    Some(l) => l,
                    None => break,
                };
            }
            let lno = cur.line_no;
            if line.len() < 1 {
                return Err(syntax(lno, "empty line"));
            }
            let c = line[0];
            if c < prev_type {
                return Err(syntax(lno, "cards not in lexicographic order"));
            }
            if line.len() > 1 && line[1] != b' ' {
                return Err(syntax(lno, "missing space after card letter"));
            }
            prev_type = c;
            seen_header = true;
            if c != b'Z' {
                md5.consume(line);
                md5.consume(b"\n");
            }
            let tok = tokens(line);
            if c != b'U' && tok.iter().any(|t| t.is_empty()) {
                // Doubled or trailing separators are not tolerated.
                return Err(syntax(lno, "malformed card"));
            }
            match c {
                // A <filename> <target> ?<source>?
                b'A' => {
                    if !(tok.len() == 2 || tok.len() == 3) || p.attach_name.is_some() {
                        return Err(syntax(lno, "malformed A card"));
                    }
                    let name = defossilize(tok[0]);
                    if !is_simple_pathname(&name) {
                        return Err(syntax(lno, "A card filename is not simple"));
                    }
                    let target = defossilize(tok[1]);
                    if target.is_empty() {
                        return Err(syntax(lno, "empty A card target"));
                    }
                    if tok.len() == 3 {
                        p.attach_src = Some(want_hash(tok[2], lno)?);
                    }
                    // Keep only the basename of the attachment.
                    p.attach_name =
                        Some(name.rsplit('/').next().unwrap_or(&name).to_string());
                    p.attach_target = Some(target);
                }
                // B <baseline-hash>
                b'B' => {
                    if tok.len() != 1 || p.baseline.is_some() {
                        return Err(syntax(lno, "malformed B card"));
                    }
                    p.baseline = Some(want_hash(tok[0], lno)?);
                }
                // C <comment>
                b'C' => {
                    if tok.len() != 1 || p.comment.is_some() {
                        return Err(syntax(lno, "malformed C card"));
                    }
                    p.comment = Some(defossilize(tok[0]));
                }
                // D <timestamp>
                b'D' => {
                    if tok.len() != 1 || p.date != 0.0 {
                        return Err(syntax(lno, "malformed D card"));
                    }
                    p.date = parse_card_date(tok[0])
                        .ok_or_else(|| syntax(lno, "bad D card timestamp"))?;
                }
                // E <timestamp> <event-id>
                b'E' => {
                    if tok.len() != 2 || p.event_date != 0.0 {
                        return Err(syntax(lno, "malformed E card"));
                    }
                    p.event_date = parse_card_date(tok[0])
                        .ok_or_else(|| syntax(lno, "bad E card timestamp"))?;
                    p.event_id = Some(want_hash(tok[1], lno)?);
                }
                // F <filename> ?<uuid> ?<perm> ?<oldname>??
                b'F' => {
                    if tok.is_empty() || tok.len() > 4 {
                        return Err(syntax(lno, "malformed F card"));
                    }
                    let name = defossilize(tok[0]);
                    if !is_simple_pathname(&name) {
                        return Err(syntax(lno, "F card filename is not simple"));
                    }
                    let uuid = if tok.len() >= 2 {
                        Some(want_hash(tok[1], lno)?)
                    } else {
                        None
                    };
                    let perm = if tok.len() >= 3 { tok[2].to_string() } else { String::new() };
                    let prior = if tok.len() == 4 {
                        let z = defossilize(tok[3]);
                        if !is_simple_pathname(&z) {
                            return Err(syntax(lno, "F card prior name is not simple"));
                        }
                        Some(z)
                    } else {
                        None
                    };
                    if let Some(last) = p.files.last() {
                        if last.name.as_str() >= name.as_str() {
                            return Err(syntax(lno, "F cards out of order"));
                        }
                    }
                    p.files.push(FileCard {
                        name,
                        uuid,
                        perm,
                        prior,
                    });
                }
                // J ?+?<name> ?<value>?
                b'J' => {
                    if tok.is_empty() || tok.len() > 2 {
                        return Err(syntax(lno, "malformed J card"));
                    }
                    let raw = tok[0];
                    let (append, name) = match raw.strip_prefix('+') {
                        Some(rest) => (true, rest.to_string()),
                        None => (false, raw.to_string()),
                    };
                    if name.is_empty() {
                        return Err(syntax(lno, "empty J card field"));
                    }
                    let value = if tok.len() == 2 {
                        defossilize(tok[1])
                    } else {
                        String::new()
                    };
                    // Ordering is over the raw token, prefix included.
                    if let Some(last) = p.fields.last() {
                        let last_raw = if last.append {
                            format!("+{}", last.name)
                        } else {
                            last.name.clone()
                        };
                        if last_raw.as_str() >= raw {
                            return Err(syntax(lno, "J cards out of order"));
                        }
                    }
                    p.fields.push(FieldCard {
                        name,
                        append,
                        value,
                    });
                }
                // K <ticket-uuid>
                b'K' => {
                    if tok.len() != 1 || p.ticket_uuid.is_some() {
                        return Err(syntax(lno, "malformed K card"));
                    }
                    p.ticket_uuid = Some(want_hash(tok[0], lno)?);
                }
                // L <wikititle>
                b'L' => {
                    if tok.len() != 1 || p.wiki_title.is_some() {
                        return Err(syntax(lno, "malformed L card"));
                    }
                    let title = defossilize(tok[0]);
                    if title.is_empty() {
                        return Err(syntax(lno, "empty L card title"));
                    }
                    p.wiki_title = Some(title);
                }
                // M <uuid>
                b'M' => {
                    if tok.len() != 1 {
                        return Err(syntax(lno, "malformed M card"));
                    }
                    let uuid = want_hash(tok[0], lno)?;
                    if let Some(last) = p.cluster.last() {
                        if last.as_str() >= uuid.as_str() {
                            return Err(syntax(lno, "M cards out of order"));
                        }
                    }
                    p.cluster.push(uuid);
                }
                // N <mimetype>
                b'N' => {
                    if tok.len() != 1 || p.mimetype.is_some() {
                        return Err(syntax(lno, "malformed N card"));
                    }
                    p.mimetype = Some(defossilize(tok[0]));
                }
                // P <uuid> ...
                b'P' => {
                    if tok.is_empty() {
                        return Err(syntax(lno, "malformed P card"));
                    }
                    for z in tok {
                        p.parents.push(want_hash(z, lno)?);
                    }
                }
                // Q (+|-)<target> ?<baseline>?
                b'Q' => {
                    if tok.is_empty() || tok.len() > 2 {
                        return Err(syntax(lno, "malformed Q card"));
                    }
                    let sign = match tok[0].as_bytes().first() {
                        Some(b'+') => '+',
                        Some(b'-') => '-',
                        _ => return Err(syntax(lno, "Q card must begin with + or -")),
                    };
                    let target = want_hash(&tok[0][1..], lno)?;
                    let baseline = if tok.len() == 2 {
                        Some(want_hash(tok[1], lno)?)
                    } else {
                        None
                    };
                    p.cherrypicks.push(CherrypickCard {
                        sign,
                        target,
                        baseline,
                    });
                }
                // R <md5>
                b'R' => {
                    if tok.len() != 1 || p.repo_cksum.is_some() || !is_md5_hex(tok[0]) {
                        return Err(syntax(lno, "malformed R card"));
                    }
                    p.repo_cksum = Some(tok[0].to_string());
                }
                // T (+|*|-)<name> (<uuid>|*) ?<value>?
                b'T' => {
                    if tok.len() < 2 || tok.len() > 3 {
                        return Err(syntax(lno, "malformed T card"));
                    }
                    let raw = defossilize(tok[0]);
                    let prefix = match raw.as_bytes().first() {
                        Some(b'+') => '+',
                        Some(b'*') => '*',
                        Some(b'-') => '-',
                        _ => return Err(syntax(lno, "tag must begin with +, * or -")),
                    };
                    let name = raw[1..].to_string();
                    if name.is_empty() || name.bytes().all(|b| b.is_ascii_hexdigit()) {
                        // Tags whose names look like hashes are forbidden.
                        return Err(syntax(lno, "tag name looks like a hash"));
                    }
                    let uuid = if tok[1] == "*" {
                        None
                    } else {
                        Some(want_hash(tok[1], lno)?)
                    };
                    let value = if tok.len() == 3 {
                        Some(defossilize(tok[2]))
                    } else {
                        None
                    };
                    if let Some(last) = p.tags.last() {
                        let last_raw = format!("{}{}", last.prefix, last.name);
                        if last_raw.as_str() >= raw.as_str() {
                            return Err(syntax(lno, "T cards out of order"));
                        }
                    }
                    p.tags.push(TagCard {
                        prefix,
                        name,
                        uuid,
                        value,
                    });
                }
                // U ?<login>?
                b'U' => {
                    if tok.len() > 1 || p.user.is_some() {
                        return Err(syntax(lno, "malformed U card"));
                    }
                    let login = if tok.is_empty() || tok[0].is_empty() {
                        "anonymous".to_string()
                    } else {
                        defossilize(tok[0])
                    };
                    p.user = Some(login);
                }
                // W <size>\n<bytes>\n
                b'W' => {
                    if tok.len() != 1 || p.wiki.is_some() {
                        return Err(syntax(lno, "malformed W card"));
                    }
                    let size: usize = tok[0]
                        .parse()
                        .map_err(|_| syntax(lno, "bad W card size"))?;
                    let body = cur
                        .take(size + 1)
                        .ok_or_else(|| syntax(lno, "short W card body"))?;
                    if body[size] != b'\n' {
                        return Err(syntax(lno, "W card body not newline-terminated"));
                    }
                    md5.consume(body);
                    p.wiki = Some(
                        String::from_utf8(body[..size].to_vec())
                            .map_err(|_| syntax(lno, "W card body is not UTF-8"))?,
                    );
                }
                // Z <md5>
                b'Z' => {
                    if tok.len() != 1 || !is_md5_hex(tok[0]) {
                        return Err(syntax(lno, "malformed Z card"));
                    }
                    let got = format!("{:x}", md5.clone().compute());
                    if got != tok[0] {
                        return Err(syntax(lno, "Z card checksum mismatch"));
                    }
                    seen_z = true;
                }
                _ => {
                    return Err(syntax(lno, format!("unknown card `{}`", c as char)));
                }
            }
        }
        if !seen_header {
            return Err(syntax(cur.line_no, "no cards found"));
        }
        p.classify(cur.line_no, seen_z)?;
        Ok(p)
    }

    /// Determine the variant and enforce its presence constraints.
    fn classify(&mut self, line: usize, seen_z: bool) -> Result<()> {
        let e = |d: &str| syntax(line, d.to_string());
        let no_attach = self.attach_name.is_none();
        let no_wiki = self.wiki.is_none() && self.wiki_title.is_none();
        let no_ticket = self.ticket_uuid.is_none() && self.fields.is_empty();
        let no_event = self.event_id.is_none();
        // The mimetype card belongs to attachments alone.
        if self.mimetype.is_some() && no_attach {
            return Err(e("N card without an attachment"));
        }

        if !self.files.is_empty() || self.repo_cksum.is_some() || self.baseline.is_some() {
            if !self.cluster.is_empty() {
                return Err(e("manifest cannot hold M cards"));
            }
            if self.date <= 0.0 {
                return Err(e("manifest requires a D card"));
            }
            if !(no_ticket && no_wiki && no_event && no_attach) {
                return Err(e("manifest holds cards of another variant"));
            }
            self.kind = Some(ArtifactKind::Manifest);
        } else if !self.cluster.is_empty() {
            if self.date > 0.0
                || self.comment.is_some()
                || self.user.is_some()
                || !self.tags.is_empty()
                || !self.parents.is_empty()
                || !self.cherrypicks.is_empty()
                || !(no_ticket && no_wiki && no_event && no_attach)
            {
                return Err(e("cluster holds cards of another variant"));
            }
            if !seen_z {
                return Err(e("cluster requires a Z card"));
            }
            self.kind = Some(ArtifactKind::Cluster);
        } else if !self.fields.is_empty() {
            if self.date <= 0.0 {
                return Err(e("ticket requires a D card"));
            }
            if self.ticket_uuid.is_none() {
                return Err(e("ticket requires a K card"));
            }
            if self.user.is_none() {
                return Err(e("ticket requires a U card"));
            }
            if !self.tags.is_empty() || !no_wiki || !no_event || !no_attach {
                return Err(e("ticket holds cards of another variant"));
            }
            if !seen_z {
                return Err(e("ticket requires a Z card"));
            }
            self.kind = Some(ArtifactKind::Ticket);
        } else if self.event_id.is_some() {
            if self.date <= 0.0 {
                return Err(e("event requires a D card"));
            }
            if self.wiki.is_none() {
                return Err(e("event requires a W card"));
            }
            if self.wiki_title.is_some() || !no_ticket || !no_attach {
                return Err(e("event holds cards of another variant"));
            }
            for t in &self.tags {
                if t.prefix != '+' || t.uuid.is_some() {
                    return Err(e("event tags must be +tag on self"));
                }
            }
            if !seen_z {
                return Err(e("event requires a Z card"));
            }
            self.kind = Some(ArtifactKind::Event);
        } else if self.wiki.is_some() {
            if self.date <= 0.0 {
                return Err(e("wiki requires a D card"));
            }
            if self.wiki_title.is_none() {
                return Err(e("wiki requires an L card"));
            }
            if !self.tags.is_empty() || !no_ticket || !no_attach {
                return Err(e("wiki holds cards of another variant"));
            }
            if !seen_z {
                return Err(e("wiki requires a Z card"));
            }
            self.kind = Some(ArtifactKind::Wiki);
        } else if !self.tags.is_empty() {
            if self.date <= 0.0 {
                return Err(e("control requires a D card"));
            }
            if !self.parents.is_empty() || !self.cherrypicks.is_empty() {
                return Err(e("control cannot hold parents"));
            }
            if self.wiki_title.is_some() || !no_ticket || !no_attach {
                return Err(e("control holds cards of another variant"));
            }
            if !seen_z {
                return Err(e("control requires a Z card"));
            }
            self.kind = Some(ArtifactKind::Control);
        } else if self.attach_name.is_some() {
            if self.date <= 0.0 {
                return Err(e("attachment requires a D card"));
            }
            if !no_ticket || self.wiki_title.is_some() {
                return Err(e("attachment holds cards of another variant"));
            }
            if !seen_z {
                return Err(e("attachment requires a Z card"));
            }
            self.kind = Some(ArtifactKind::Attachment);
        } else {
            // A check-in with no files at all (an empty tree).
            if self.date <= 0.0 {
                return Err(e("manifest requires a D card"));
            }
            if !(no_ticket && no_wiki && no_event && no_attach) {
                return Err(e("manifest holds cards of another variant"));
            }
            self.kind = Some(ArtifactKind::Manifest);
        }
        Ok(())
    }

    pub fn kind(&self) -> ArtifactKind {
        self.kind.expect("classified at parse time")
    }

    /// The effective sorted file list of a manifest. For a baseline
    /// manifest this is just the F cards; for a delta manifest the baseline
    /// list is patched by this artifact's own cards (a card with no hash is
    /// a deletion). Fails if the baseline is a phantom.
    pub fn full_file_list(&self, repo: &mut Repository) -> Result<Vec<FileCard>> {
        let Some(baseline_uuid) = &self.baseline else {
            return Ok(self.files.clone());
        };
        let base_rid = repo
            .rid_for_uuid(baseline_uuid)?
            .ok_or_else(|| RepoError::MissingArtifact(baseline_uuid.clone()))?;
        let base = parse_artifact(repo, base_rid)?;
        let base_files = base.full_file_list(repo)?;

        // Merge-join the sorted baseline list with our own patch cards.
        let mut out = Vec::with_capacity(base_files.len() + self.files.len());
        let mut i = 0;
        let mut j = 0;
        while i < base_files.len() && j < self.files.len() {
            match base_files[i].name.cmp(&self.files[j].name) {
                std::cmp::Ordering::Less => {
                    out.push(base_files[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    if self.files[j].uuid.is_some() {
                        out.push(self.files[j].clone());
                    }
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    if self.files[j].uuid.is_some() {
                        out.push(self.files[j].clone());
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&base_files[i..]);
        for f in &self.files[j..] {
            if f.uuid.is_some() {
                out.push(f.clone());
            }
        }
        Ok(out)
    }
}

/// Load and parse the control artifact stored as `rid`, going through the
/// repository's parse cache.
pub fn parse_artifact(repo: &mut Repository, rid: i64) -> Result<ControlArtifact> {
    if let Some(m) = repo.manifest_cache.find(rid) {
        return Ok(m);
    }
    let content = store::get(repo, rid)?;
    let m = ControlArtifact::parse(content)?;
    repo.manifest_cache.insert(rid, m.clone());
    Ok(m)
}

/// A small LRU of parsed artifacts, keyed by rid. Reduces re-parsing
/// during rebuild and mlink construction. Lookups *take* the entry.
#[derive(Default)]
pub struct ManifestCache {
    entries: Vec<(i64, u64, ControlArtifact)>,
    age: u64,
}

const MANIFEST_CACHE_SLOTS: usize = 4;

impl ManifestCache {
    pub fn insert(&mut self, rid: i64, m: ControlArtifact) {
        self.age += 1;
        if self.entries.len() >= MANIFEST_CACHE_SLOTS {
            if let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, age, _))| *age)
                .map(|(i, _)| i)
            {
                self.entries.swap_remove(oldest);
            }
        }
        self.entries.push((rid, self.age, m));
    }

    pub fn find(&mut self, rid: i64) -> Option<ControlArtifact> {
        let idx = self.entries.iter().position(|(r, _, _)| *r == rid)?;
        Some(self.entries.swap_remove(idx).2)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.age = 0;
    }
}

/// Compute the Z-card value for manifest text built so far (everything that
/// will precede the Z line).
pub fn md5_of_cards(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

impl FromStr for ControlArtifact {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<ControlArtifact> {
        ControlArtifact::parse(s.as_bytes().to_vec())
    }
}
