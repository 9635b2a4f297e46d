use anyhow::{Context, Result};
use glob::glob;
use std::path::Path;

/// Columna de encabezado que escribe el agregador; si aparece en una lista se saltea.
const HEADER_FIRST_COLUMN: &str = "filename";

fn is_pattern(input: &str) -> bool {
    input.contains(['*', '?', '['])
}

/// Resuelve la lista de archivos a procesar.
///
/// - varios argumentos: se usan tal cual
/// - un `.tsv`: primera columna de cada fila (sin comentarios `#` ni encabezado)
/// - un patrón glob: se expande bajo `base_path`
/// - un único archivo: se usa tal cual
///
/// Los ids que devuelve son relativos a `base_path` (o absolutos).
pub fn resolve(inputs: &[String], base_path: &Path) -> Result<Vec<String>> {
    match inputs {
        [single] if single.ends_with(".tsv") => from_tsv(Path::new(single)),
        [single] if is_pattern(single) => from_glob(single, base_path),
        many => Ok(many.to_vec()),
    }
}

fn from_tsv(path: &Path) -> Result<Vec<String>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_path(path)
        .with_context(|| format!("cannot read file list {}", path.display()))?;

    let mut files = Vec::new();
    for row in rdr.records() {
        let row = row.with_context(|| format!("malformed row in {}", path.display()))?;
        let Some(first) = row.get(0).map(str::trim) else {
            continue;
        };
        if first.is_empty() || first == HEADER_FIRST_COLUMN {
            continue;
        }
        files.push(first.to_string());
    }
    Ok(files)
}

fn from_glob(pattern: &str, base_path: &Path) -> Result<Vec<String>> {
    let full = base_path.join(pattern);
    let full = full.to_string_lossy();

    let mut files = Vec::new();
    for entry in glob(&full).with_context(|| format!("invalid glob pattern {}", full))? {
        let path = entry?;
        if !path.is_file() {
            continue;
        }
        let rel = path.strip_prefix(base_path).unwrap_or(&path);
        files.push(rel.to_string_lossy().to_string());
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, path::PathBuf};

    fn scratch(sub: &str) -> PathBuf {
        let dir = env::temp_dir()
            .join(format!("histoqc_client_tests_{}", std::process::id()))
            .join(sub);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn owned(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn varios_argumentos_se_usan_tal_cual() {
        let files = resolve(&owned(&["a.svs", "dir/b.svs"]), Path::new("/base")).unwrap();
        assert_eq!(files, owned(&["a.svs", "dir/b.svs"]));
    }

    #[test]
    fn lista_tsv_ignora_comentarios_y_encabezado() {
        let dir = scratch("inputs_tsv");
        let list = dir.join("results.tsv");
        fs::write(
            &list,
            "#dataset: prueba\nfilename\twidth\twarnings\na.svs\t10\t\n\nsub/b.svs\t12\tw1\n",
        )
        .unwrap();

        let files = resolve(&owned(&[list.to_str().unwrap()]), Path::new("")).unwrap();
        assert_eq!(files, owned(&["a.svs", "sub/b.svs"]));
    }

    #[test]
    fn glob_se_expande_bajo_la_base_y_queda_relativo() {
        let dir = scratch("inputs_glob");
        fs::create_dir_all(dir.join("slides")).unwrap();
        for name in ["b.png", "a.png", "notes.txt"] {
            fs::write(dir.join("slides").join(name), b"x").unwrap();
        }
        fs::create_dir_all(dir.join("slides").join("dir.png")).unwrap();

        let files = resolve(&owned(&["slides/*.png"]), &dir).unwrap();
        assert_eq!(files, owned(&["slides/a.png", "slides/b.png"]));
    }

    #[test]
    fn glob_sin_coincidencias_da_lista_vacia() {
        let dir = scratch("inputs_glob_empty");
        assert!(resolve(&owned(&["*.svs"]), &dir).unwrap().is_empty());
    }
}
