pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE IF NOT EXISTS hosts (
  hostport        TEXT PRIMARY KEY,
  version         TEXT NOT NULL DEFAULT '',
  fingerprint     TEXT NOT NULL DEFAULT '',
  seen_first      INTEGER NOT NULL,
  seen_last       INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
  user            TEXT NOT NULL,
  password        TEXT NOT NULL,
  scan_interval   INTEGER NOT NULL DEFAULT 14,
  PRIMARY KEY (user, password)
);

CREATE TABLE IF NOT EXISTS host_creds (
  hostport        TEXT NOT NULL,
  user            TEXT NOT NULL,
  password        TEXT NOT NULL,
  last_tested     INTEGER NOT NULL DEFAULT 0,
  result          TEXT NOT NULL DEFAULT '' CHECK (result IN ('','auth','tunnel','exec')),
  scan_interval   INTEGER NOT NULL DEFAULT 14,
  PRIMARY KEY (hostport, user, password)
);

CREATE TABLE IF NOT EXISTS host_changes (
  time            INTEGER NOT NULL,
  hostport        TEXT NOT NULL,
  type            TEXT NOT NULL CHECK (type IN ('fingerprint','version')),
  old             TEXT NOT NULL,
  new             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id          TEXT PRIMARY KEY,
  kind            TEXT NOT NULL,
  started_at      INTEGER NOT NULL,
  finished_at     INTEGER,
  total           INTEGER DEFAULT 0,
  positive        INTEGER DEFAULT 0,
  negative        INTEGER DEFAULT 0,
  errors          INTEGER DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_hosts_fingerprint ON hosts(fingerprint);
CREATE INDEX IF NOT EXISTS idx_hosts_seen ON hosts(seen_last);
CREATE INDEX IF NOT EXISTS idx_host_creds_tested ON host_creds(last_tested);
CREATE INDEX IF NOT EXISTS idx_host_creds_result ON host_creds(result);
CREATE INDEX IF NOT EXISTS idx_host_changes_host ON host_changes(hostport);

COMMIT;
"#
;
