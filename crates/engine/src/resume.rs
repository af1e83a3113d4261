//! Resume-scope naming (§4.9): `"db:{db}:{all|hash8-of-sorted-collection-list}"`.

use sha1::{Digest, Sha1};

pub fn resume_scope(db_name: &str, collections: Option<&[String]>) -> String {
    match collections {
        None => format!("db:{db_name}:all"),
        Some(collections) => {
            let mut sorted: Vec<&str> = collections.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            format!("db:{db_name}:{}", hash8(&sorted.join(",")))
        }
    }
}

fn hash8(input: &str) -> String {
    let digest = Sha1::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_filter_uses_all() {
        assert_eq!(resume_scope("app", None), "db:app:all");
    }

    #[test]
    fn filter_hashes_sorted_collection_list() {
        let a = resume_scope("app", Some(&["b".to_string(), "a".to_string()]));
        let b = resume_scope("app", Some(&["a".to_string(), "b".to_string()]));
        assert_eq!(a, b, "hash must not depend on input order");
    }

    #[test]
    fn different_collection_sets_hash_differently() {
        let a = resume_scope("app", Some(&["a".to_string()]));
        let b = resume_scope("app", Some(&["b".to_string()]));
        assert_ne!(a, b);
    }
}
