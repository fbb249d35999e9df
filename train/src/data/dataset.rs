use super::*;
use crate::common::*;

/// File extensions recognized as images.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "webp"];

/// The generic dataset trait.
pub trait GenericDataset
where
    Self: Debug + Sync + Send,
{
    /// The list of class names of the dataset. The index of a name is its label.
    fn classes(&self) -> &[String];

    fn num_classes(&self) -> usize {
        self.classes().len()
    }
}

/// The dataset with a list of image paths.
pub trait FileDataset
where
    Self: GenericDataset,
{
    /// Get the list of image paths in the dataset.
    fn records(&self) -> &[Arc<FileRecord>];

    /// Count records per class.
    fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_classes()];
        self.records()
            .iter()
            .for_each(|record| counts[record.label] += 1);
        counts
    }

    /// Compute class weights inversely proportional to class frequencies.
    ///
    /// The weight of class `c` is `total / (num_classes * count_c)`. Classes
    /// without records get zero weight.
    fn balanced_class_weights(&self) -> Vec<f64> {
        let counts = self.class_counts();
        let total: usize = counts.iter().sum();
        let num_classes = counts.len();

        counts
            .into_iter()
            .map(|count| {
                if count == 0 {
                    0.0
                } else {
                    total as f64 / (num_classes * count) as f64
                }
            })
            .collect()
    }
}

/// The dataset laid out as one subdirectory of images per class.
#[derive(Debug, Clone)]
pub struct ClassDirDataset {
    classes: Vec<String>,
    records: Vec<Arc<FileRecord>>,
}

impl GenericDataset for ClassDirDataset {
    fn classes(&self) -> &[String] {
        &self.classes
    }
}

impl FileDataset for ClassDirDataset {
    fn records(&self) -> &[Arc<FileRecord>] {
        &self.records
    }
}

impl ClassDirDataset {
    /// Scan a class directory tree.
    ///
    /// If `classes` is not given, the sorted subdirectory names are used.
    pub async fn load<P>(dataset_dir: P, classes: Option<&[String]>) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let dataset_dir = dataset_dir.as_ref();

        let classes: Vec<String> = match classes {
            Some(classes) => classes.to_vec(),
            None => {
                let mut classes = vec![];
                let mut entries = tokio::fs::read_dir(dataset_dir)
                    .await
                    .with_context(|| format!("cannot open '{}'", dataset_dir.display()))?;

                while let Some(entry) = entries.next_entry().await? {
                    if !entry.file_type().await?.is_dir() {
                        continue;
                    }
                    let name = entry
                        .file_name()
                        .into_string()
                        .map_err(|name| format_err!("non-unicode class name {:?}", name))?;
                    classes.push(name);
                }

                classes.sort();
                classes
            }
        };
        ensure!(
            !classes.is_empty(),
            "no class directory found in '{}'",
            dataset_dir.display()
        );

        let mut records = vec![];

        for (label, class) in classes.iter().enumerate() {
            let class_dir = dataset_dir.join(class);
            let is_dir = tokio::fs::metadata(&class_dir)
                .await
                .map(|metadata| metadata.is_dir())
                .unwrap_or(false);
            ensure!(
                is_dir,
                "class directory '{}' does not exist",
                class_dir.display()
            );

            let mut paths = vec![];
            let mut entries = tokio::fs::read_dir(&class_dir).await?;

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_file() && is_image_file(&path) {
                    paths.push(path);
                }
            }
            paths.sort();

            info!("class: {}, label: {}, number: {}", class, label, paths.len());

            records.extend(
                paths
                    .into_iter()
                    .map(|path| Arc::new(FileRecord { path, label })),
            );
        }

        ensure!(
            !records.is_empty(),
            "no image found in '{}'",
            dataset_dir.display()
        );

        Ok(Self { classes, records })
    }

    /// Randomly hold out a ratio of records.
    ///
    /// It returns the remaining and the held out datasets. Both contain at
    /// least one record.
    pub fn split<R>(&self, ratio: f64, rng: &mut R) -> Result<(Self, Self)>
    where
        R: Rng + ?Sized,
    {
        ensure!(
            ratio > 0.0 && ratio < 1.0,
            "split ratio must be in range (0, 1)"
        );
        let num_records = self.records.len();
        ensure!(
            num_records >= 2,
            "at least two records are required to split the dataset"
        );

        let num_held_out = ((num_records as f64 * ratio).round() as usize).clamp(1, num_records - 1);

        let mut records = self.records.clone();
        records.shuffle(rng);
        let held_out = records.split_off(num_records - num_held_out);

        Ok((
            Self {
                classes: self.classes.clone(),
                records,
            },
            Self {
                classes: self.classes.clone(),
                records: held_out,
            },
        ))
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) -> Result<()> {
        std::fs::write(path, b"")?;
        Ok(())
    }

    fn make_tree(root: &Path, layout: &[(&str, usize)]) -> Result<()> {
        for &(class, count) in layout {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir)?;
            for index in 0..count {
                touch(&dir.join(format!("{}.{}.jpg", class, index)))?;
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn load_with_sorted_subdirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        make_tree(dir.path(), &[("dog", 3), ("cat", 2)])?;
        touch(&dir.path().join("README.txt"))?;
        touch(&dir.path().join("dog").join("notes.txt"))?;

        let dataset = ClassDirDataset::load(dir.path(), None).await?;
        assert_eq!(dataset.classes(), &["cat".to_string(), "dog".to_string()]);
        assert_eq!(dataset.records().len(), 5);
        assert_eq!(dataset.class_counts(), vec![2, 3]);

        Ok(())
    }

    #[tokio::test]
    async fn load_with_given_class_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        make_tree(dir.path(), &[("dog", 3), ("cat", 1)])?;

        let classes = vec!["dog".to_string(), "cat".to_string()];
        let dataset = ClassDirDataset::load(dir.path(), Some(&classes[..])).await?;
        assert_eq!(dataset.class_counts(), vec![3, 1]);
        assert!(dataset
            .records()
            .iter()
            .all(|record| record.path.to_str().unwrap().contains(&classes[record.label])));

        let weights = dataset.balanced_class_weights();
        assert!((weights[0] - 4.0 / 6.0).abs() < 1e-9);
        assert!((weights[1] - 2.0).abs() < 1e-9);

        Ok(())
    }

    #[tokio::test]
    async fn missing_class_dir_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        make_tree(dir.path(), &[("dog", 1)])?;

        let classes = vec!["dog".to_string(), "cat".to_string()];
        assert!(ClassDirDataset::load(dir.path(), Some(&classes[..]))
            .await
            .is_err());

        Ok(())
    }

    #[tokio::test]
    async fn empty_dataset_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        make_tree(dir.path(), &[("dog", 0), ("cat", 0)])?;
        assert!(ClassDirDataset::load(dir.path(), None).await.is_err());
        Ok(())
    }

    #[test]
    fn split_keeps_every_record() -> Result<()> {
        let classes = vec!["dog".to_string(), "cat".to_string()];
        let records = (0..10)
            .map(|index| {
                Arc::new(FileRecord {
                    path: PathBuf::from(format!("{}.jpg", index)),
                    label: index % 2,
                })
            })
            .collect();
        let dataset = ClassDirDataset { classes, records };

        let mut rng = StdRng::seed_from_u64(7);
        let (train, val) = dataset.split(0.2, &mut rng)?;
        assert_eq!(train.records().len(), 8);
        assert_eq!(val.records().len(), 2);

        let mut paths = train
            .records()
            .iter()
            .chain(val.records())
            .map(|record| record.path.clone())
            .collect_vec();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 10);

        // tiny ratios still hold out one record
        let (_, val) = dataset.split(0.01, &mut rng)?;
        assert_eq!(val.records().len(), 1);

        Ok(())
    }
}
