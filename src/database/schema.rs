pub const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = -64000;
    PRAGMA foreign_keys = ON;
";

pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS posts (
        id INTEGER PRIMARY KEY,
        rating TEXT NOT NULL CHECK (rating IN ('s', 'q', 'e')),
        score INTEGER NOT NULL DEFAULT 0,
        fav_count INTEGER NOT NULL DEFAULT 0,
        width INTEGER NOT NULL DEFAULT 0,
        height INTEGER NOT NULL DEFAULT 0,
        file_size INTEGER NOT NULL DEFAULT 0,
        file_ext TEXT NOT NULL,
        md5 TEXT,
        source TEXT,
        created_at TEXT
    );

    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY,
        name TEXT UNIQUE NOT NULL
    );

    CREATE TABLE IF NOT EXISTS post_tags (
        post_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        FOREIGN KEY(post_id) REFERENCES posts(id) ON DELETE CASCADE,
        FOREIGN KEY(tag_id) REFERENCES tags(id),
        PRIMARY KEY(post_id, tag_id)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS captions (
        post_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        body TEXT NOT NULL,
        FOREIGN KEY(post_id) REFERENCES posts(id) ON DELETE CASCADE,
        PRIMARY KEY(post_id, kind)
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS ingest_cursor (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        shard_index INTEGER NOT NULL,
        shard_name TEXT NOT NULL,
        record_offset INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS shard_ledger (
        name TEXT PRIMARY KEY,
        status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
        digest TEXT,
        records INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_post_tags_tag ON post_tags(tag_id, post_id);
    CREATE INDEX IF NOT EXISTS idx_posts_rating ON posts(rating);
    CREATE INDEX IF NOT EXISTS idx_posts_score ON posts(score);
    CREATE INDEX IF NOT EXISTS idx_posts_fav_count ON posts(fav_count);
    CREATE INDEX IF NOT EXISTS idx_posts_file_ext ON posts(file_ext);
";
