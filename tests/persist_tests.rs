//! Snapshot persistence unit tests

#[cfg(test)]
mod tests {
    use battlemat::geom::{Shape, ShapeKind, Vec2};
    use battlemat::imagestore::{Image, ImageStore, ImageStoreSnapshot};
    use battlemat::map::Map;
    use battlemat::persist::{load_aggregate, save_aggregate};
    use battlemat::registry::{MapRegistry, RegistrySnapshot};
    use battlemat::types::{MapSettings, Token};
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("battlemat-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn populated_registry() -> (MapRegistry, Map) {
        let registry = MapRegistry::new((8, 6));
        let shared = registry.get_or_create("table-1");
        {
            let mut map = shared.lock();
            map.add_token(Token::new("hero", Vec2::new(2, 2))).unwrap();
            map.add_token(Token::new("wolf", Vec2::new(5, 1))).unwrap();
            map.set_color(Vec2::new(0, 0), "#202020").unwrap();
            map.add_effect(
                Shape::new(ShapeKind::Circle, Vec2::new(3, 3), Vec2::new(5, 3)),
                "#ff00ff",
            )
            .unwrap();
            map.set_spawn(Some(Shape::new(
                ShapeKind::Mask,
                Vec2::new(0, 4),
                Vec2::new(2, 5),
            )))
            .unwrap();
            map.set_settings(MapSettings {
                distance_ratio: 1.5,
                unit: "m".into(),
            });
            map.set_sprite_binding("hero", "img-1");
        }
        let reference = registry.get("table-1").unwrap().lock().clone();
        (registry, reference)
    }

    // -----------------------------------------------------------------------
    // Round trips
    // -----------------------------------------------------------------------

    #[test]
    fn registry_roundtrips_through_disk() {
        let dir = temp_dir("registry-roundtrip");
        let (registry, reference) = populated_registry();

        save_aggregate(&dir, "maps", &registry.snapshot()).unwrap();
        let loaded: RegistrySnapshot = load_aggregate(&dir, "maps").expect("snapshot should load");
        let restored = MapRegistry::restore(loaded, (8, 6));

        let map = restored.get("table-1").expect("map should survive");
        assert_eq!(*map.lock(), reference);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn image_store_roundtrips_through_disk() {
        let dir = temp_dir("images-roundtrip");
        let store = ImageStore::new();
        let mut map = Map::new(5, 5);
        let image = Image::Inline {
            mime: "image/png".into(),
            bytes: vec![10, 20, 30],
        };
        let tok = store.bind(&mut map, "hero", image.clone());

        save_aggregate(&dir, "images", &store.snapshot()).unwrap();
        let loaded: ImageStoreSnapshot =
            load_aggregate(&dir, "images").expect("snapshot should load");
        let restored = ImageStore::restore(loaded);

        assert_eq!(restored.get(&tok).unwrap(), image);
        assert_eq!(restored.refs(&tok), Some(1));
        let _ = fs::remove_dir_all(&dir);
    }

    // -----------------------------------------------------------------------
    // Rotation and recovery
    // -----------------------------------------------------------------------

    #[test]
    fn second_save_rotates_primary_to_backup() {
        let dir = temp_dir("rotation");
        let (registry, _) = populated_registry();

        save_aggregate(&dir, "maps", &registry.snapshot()).unwrap();
        assert!(dir.join("maps.json.gz").exists());
        assert!(!dir.join("maps.json.gz.bak").exists());

        save_aggregate(&dir, "maps", &registry.snapshot()).unwrap();
        assert!(dir.join("maps.json.gz").exists());
        assert!(dir.join("maps.json.gz.bak").exists());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let dir = temp_dir("fallback");
        let (registry, reference) = populated_registry();

        // Two saves so the good snapshot sits in the backup slot too.
        save_aggregate(&dir, "maps", &registry.snapshot()).unwrap();
        save_aggregate(&dir, "maps", &registry.snapshot()).unwrap();
        fs::write(dir.join("maps.json.gz"), b"not a gzip stream").unwrap();

        let loaded: RegistrySnapshot =
            load_aggregate(&dir, "maps").expect("backup should recover");
        let restored = MapRegistry::restore(loaded, (8, 6));
        assert_eq!(*restored.get("table-1").unwrap().lock(), reference);

        // The corrupt file was renamed aside for forensics, not deleted.
        let aside = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("maps.json.gz.corrupt-")
            });
        assert!(aside, "corrupt primary should be renamed aside");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn both_files_corrupt_starts_empty() {
        let dir = temp_dir("double-corrupt");
        fs::write(dir.join("maps.json.gz"), b"junk").unwrap();
        fs::write(dir.join("maps.json.gz.bak"), b"more junk").unwrap();

        let loaded: Option<RegistrySnapshot> = load_aggregate(&dir, "maps");
        assert!(loaded.is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_files_mean_fresh_start() {
        let dir = temp_dir("fresh");
        let loaded: Option<RegistrySnapshot> = load_aggregate(&dir, "maps");
        assert!(loaded.is_none());
        let _ = fs::remove_dir_all(&dir);
    }
}
