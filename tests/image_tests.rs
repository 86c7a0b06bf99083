//! Image store unit tests

#[cfg(test)]
mod tests {
    use battlemat::imagestore::{Image, ImageStore, ImageStoreSnapshot, StoreError};
    use battlemat::map::Map;
    use serde_json::json;

    fn inline(bytes: &[u8]) -> Image {
        Image::Inline {
            mime: "image/png".into(),
            bytes: bytes.to_vec(),
        }
    }

    // -----------------------------------------------------------------------
    // Content addressing
    // -----------------------------------------------------------------------

    #[test]
    fn identical_uploads_are_idempotent() {
        let store = ImageStore::new();
        let a = store.insert(inline(&[1, 2, 3, 4]));
        let b = store.insert(inline(&[1, 2, 3, 4]));
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn one_differing_byte_yields_a_new_entry() {
        let store = ImageStore::new();
        let a = store.insert(inline(&[1, 2, 3, 4]));
        let b = store.insert(inline(&[1, 2, 3, 5]));
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn redirects_dedupe_by_url() {
        let store = ImageStore::new();
        let a = store.insert(Image::Redirect {
            url: "https://example.com/a.png".into(),
        });
        let b = store.insert(Image::Redirect {
            url: "https://example.com/a.png".into(),
        });
        let c = store.insert(Image::Redirect {
            url: "https://example.com/c.png".into(),
        });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn mime_participates_in_structural_equality() {
        let store = ImageStore::new();
        let a = store.insert(inline(&[9, 9]));
        let b = store.insert(Image::Inline {
            mime: "image/jpeg".into(),
            bytes: vec![9, 9],
        });
        // Same digest, different structure: both entries live.
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn get_unknown_token_is_not_found() {
        let store = ImageStore::new();
        assert_eq!(store.get("missing"), Err(StoreError::NotFound));
    }

    // -----------------------------------------------------------------------
    // Upload cap
    // -----------------------------------------------------------------------

    #[test]
    fn oversized_uploads_are_rejected() {
        assert_eq!(ImageStore::check_upload(1 << 20), Ok(()));
        assert!(matches!(
            ImageStore::check_upload((1 << 20) + 1),
            Err(StoreError::TooLarge(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------------

    #[test]
    fn bind_unbind_restores_entry_count() {
        let store = ImageStore::new();
        let mut map = Map::new(5, 5);
        assert_eq!(store.len(), 0);

        let tok = store.bind(&mut map, "hero", inline(&[1]));
        assert_eq!(store.refs(&tok), Some(1));
        let tok2 = store.bind(&mut map, "wolf", inline(&[1]));
        assert_eq!(tok, tok2);
        assert_eq!(store.refs(&tok), Some(2));
        assert_eq!(store.len(), 1);

        store.unbind(&mut map, "hero").unwrap();
        assert_eq!(store.refs(&tok), Some(1));
        store.unbind(&mut map, "wolf").unwrap();
        // Last reference gone: the entry is deleted, never negative.
        assert_eq!(store.len(), 0);
        assert_eq!(store.unbind(&mut map, "wolf"), Err(StoreError::NotFound));
    }

    #[test]
    fn rebinding_identical_image_is_a_noop() {
        let store = ImageStore::new();
        let mut map = Map::new(5, 5);
        let a = store.bind(&mut map, "hero", inline(&[1, 2]));
        let b = store.bind(&mut map, "hero", inline(&[1, 2]));
        assert_eq!(a, b);
        assert_eq!(store.refs(&a), Some(1));
    }

    #[test]
    fn rebinding_replaces_and_releases_the_old_image() {
        let store = ImageStore::new();
        let mut map = Map::new(5, 5);
        let old = store.bind(&mut map, "hero", inline(&[1]));
        let new = store.bind(&mut map, "hero", inline(&[2]));
        assert_ne!(old, new);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&old), Err(StoreError::NotFound));
        assert_eq!(store.refs(&new), Some(1));
        assert_eq!(map.sprites().get("hero"), Some(&new));
    }

    #[test]
    fn refcount_survives_across_maps() {
        let store = ImageStore::new();
        let mut map_a = Map::new(5, 5);
        let mut map_b = Map::new(5, 5);
        let tok = store.bind(&mut map_a, "hero", inline(&[7]));
        let tok2 = store.bind(&mut map_b, "hero", inline(&[7]));
        assert_eq!(tok, tok2);
        assert_eq!(store.refs(&tok), Some(2));
        store.unbind(&mut map_a, "hero").unwrap();
        assert_eq!(store.get(&tok).unwrap(), inline(&[7]));
    }

    // -----------------------------------------------------------------------
    // Startup repair
    // -----------------------------------------------------------------------

    #[test]
    fn repair_deletes_unreferenced_entries() {
        let store = ImageStore::new();
        store.insert(inline(&[1, 2, 3]));
        let mut map = Map::new(5, 5);
        store.repair(&mut [&mut map]);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn repair_drops_dangling_bindings() {
        let store = ImageStore::new();
        let mut map = Map::new(5, 5);
        map.set_sprite_binding("ghost", "no-such-token");
        store.repair(&mut [&mut map]);
        assert!(map.sprites().is_empty());
    }

    #[test]
    fn repair_recomputes_refcounts_from_bindings() {
        let store = ImageStore::new();
        let mut map = Map::new(5, 5);
        let tok = store.bind(&mut map, "hero", inline(&[5]));
        // A crash-era duplicate binding the store never counted.
        map.set_sprite_binding("wolf", &tok);
        store.repair(&mut [&mut map]);
        assert_eq!(store.refs(&tok), Some(2));
    }

    #[test]
    fn repair_merges_structural_duplicates() {
        // Two structurally equal entries can only come from a snapshot
        // written by a crashed process; craft one.
        let snapshot: ImageStoreSnapshot = serde_json::from_value(json!({
            "entries": {
                "tokA": {
                    "image": { "type": "inline", "mime": "image/png", "bytes": [1, 2, 3] },
                    "refs": 1
                },
                "tokB": {
                    "image": { "type": "inline", "mime": "image/png", "bytes": [1, 2, 3] },
                    "refs": 1
                }
            }
        }))
        .unwrap();
        let store = ImageStore::restore(snapshot);
        assert_eq!(store.len(), 2);

        let mut map = Map::new(5, 5);
        map.set_sprite_binding("hero", "tokB");
        store.repair(&mut [&mut map]);

        assert_eq!(store.len(), 1);
        // The binding was rewritten to the surviving entry.
        let survivor = map.sprites().get("hero").unwrap().clone();
        assert_eq!(store.get(&survivor).unwrap(), inline(&[1, 2, 3]));
        assert_eq!(store.refs(&survivor), Some(1));
    }

    // -----------------------------------------------------------------------
    // Modified timestamps
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_tokens_report_process_start() {
        let store = ImageStore::new();
        let t1 = store.modified("never-seen");
        let t2 = store.modified("also-never-seen");
        assert_eq!(t1, t2);
    }

    #[test]
    fn inserted_entries_get_a_fresh_timestamp() {
        let store = ImageStore::new();
        let tok = store.insert(inline(&[1]));
        assert!(store.modified(&tok) >= store.modified("never-seen"));
    }
}
