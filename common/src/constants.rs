pub const MAX_NODE_ID_LEN: usize = 64;

pub const NODE_KEY_PREFIX: &str = "node";
pub const CHUNK_KEY_PREFIX: &str = "chunk";

pub const ADMIN_KEY_HEADER: &str = "X-Admin-Key";
