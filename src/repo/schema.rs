//! Repository schema. The `blob`/`delta`/`rcvfrom`/`shun`/`private`/
//! `config` tables are primary state; everything in [`DERIVED_TABLES`] is a
//! pure function of the artifact set and is dropped and regenerated by a
//! rebuild. The `vfile`/`vmerge`/`vvar` tables describe the working copy.

/// Full schema, applied idempotently at open.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS blob(
  rid INTEGER PRIMARY KEY,
  rcvid INTEGER,
  size INTEGER,
  uuid TEXT UNIQUE NOT NULL,
  content BLOB
);
CREATE TABLE IF NOT EXISTS delta(
  rid INTEGER PRIMARY KEY,
  srcid INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS delta_i1 ON delta(srcid);
CREATE TABLE IF NOT EXISTS rcvfrom(
  rcvid INTEGER PRIMARY KEY,
  uid TEXT,
  mtime REAL,
  nonce TEXT,
  ipaddr TEXT
);
CREATE TABLE IF NOT EXISTS phantom(rid INTEGER PRIMARY KEY);
CREATE TABLE IF NOT EXISTS private(rid INTEGER PRIMARY KEY);
CREATE TABLE IF NOT EXISTS shun(
  uuid TEXT PRIMARY KEY,
  mtime REAL,
  scom TEXT
);
CREATE TABLE IF NOT EXISTS unclustered(rid INTEGER PRIMARY KEY);
CREATE TABLE IF NOT EXISTS config(
  name TEXT PRIMARY KEY,
  value ANY,
  mtime REAL
);

CREATE TABLE IF NOT EXISTS filename(
  fnid INTEGER PRIMARY KEY,
  name TEXT UNIQUE
);
CREATE TABLE IF NOT EXISTS mlink(
  mid INTEGER,
  pid INTEGER,
  fid INTEGER,
  fnid INTEGER,
  pfnid INTEGER,
  pmid INTEGER,
  mperm INTEGER,
  isaux BOOLEAN DEFAULT 0
);
CREATE INDEX IF NOT EXISTS mlink_i1 ON mlink(mid);
CREATE INDEX IF NOT EXISTS mlink_i2 ON mlink(fnid);
CREATE INDEX IF NOT EXISTS mlink_i3 ON mlink(fid);
CREATE INDEX IF NOT EXISTS mlink_i4 ON mlink(pid);
CREATE TABLE IF NOT EXISTS plink(
  pid INTEGER,
  cid INTEGER,
  isprim BOOLEAN,
  mtime REAL,
  baseid INTEGER,
  UNIQUE(pid, cid)
);
CREATE INDEX IF NOT EXISTS plink_i2 ON plink(cid, pid);
CREATE TABLE IF NOT EXISTS tag(
  tagid INTEGER PRIMARY KEY,
  tagname TEXT UNIQUE
);
CREATE TABLE IF NOT EXISTS tagxref(
  tagid INTEGER,
  tagtype INTEGER,
  srcid INTEGER,
  origid INTEGER,
  value TEXT,
  mtime REAL,
  rid INTEGER,
  UNIQUE(rid, tagid)
);
CREATE INDEX IF NOT EXISTS tagxref_i1 ON tagxref(tagid, mtime);
CREATE TABLE IF NOT EXISTS event(
  type TEXT,
  mtime REAL,
  objid INTEGER PRIMARY KEY,
  tagid INTEGER,
  user TEXT,
  comment TEXT,
  bgcolor TEXT,
  euser TEXT,
  ecomment TEXT
);
CREATE INDEX IF NOT EXISTS event_i1 ON event(mtime);
CREATE TABLE IF NOT EXISTS orphan(
  rid INTEGER PRIMARY KEY,
  baseline INTEGER
);
CREATE INDEX IF NOT EXISTS orphan_baseline ON orphan(baseline);
CREATE TABLE IF NOT EXISTS attachment(
  attachid INTEGER PRIMARY KEY,
  isLatest BOOLEAN DEFAULT 0,
  mtime REAL,
  src TEXT,
  target TEXT,
  filename TEXT,
  comment TEXT,
  user TEXT
);
CREATE INDEX IF NOT EXISTS attachment_i1 ON attachment(target, filename, mtime);
CREATE TABLE IF NOT EXISTS ticket(
  tkt_id INTEGER PRIMARY KEY,
  tkt_uuid TEXT UNIQUE,
  tkt_mtime REAL,
  fields TEXT
);

CREATE TABLE IF NOT EXISTS vfile(
  id INTEGER PRIMARY KEY,
  vid INTEGER,
  chnged INTEGER DEFAULT 0,
  deleted BOOLEAN DEFAULT 0,
  isexe BOOLEAN DEFAULT 0,
  islink BOOLEAN DEFAULT 0,
  rid INTEGER,
  mrid INTEGER,
  mtime INTEGER,
  pathname TEXT,
  origname TEXT,
  mhash TEXT
);
CREATE INDEX IF NOT EXISTS vfile_vid ON vfile(vid, pathname);
CREATE TABLE IF NOT EXISTS vmerge(
  id INTEGER,
  merge INTEGER,
  mhash TEXT,
  UNIQUE(id, merge)
);
CREATE TABLE IF NOT EXISTS vvar(
  name TEXT PRIMARY KEY,
  value TEXT
);
"#;

/// Tables regenerated from scratch by `rebuild`; order is drop order.
pub const DERIVED_TABLES: &[&str] = &[
    "mlink",
    "plink",
    "tagxref",
    "tag",
    "filename",
    "event",
    "orphan",
    "attachment",
    "ticket",
    "unclustered",
    "phantom",
];
