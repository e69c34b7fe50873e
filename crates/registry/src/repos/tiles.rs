//! Sky-tessellation reference table loader.
//!
//! The tessellation lives in its own read-only SQLite store, separate from
//! the operations registry. It is loaded once at startup into the
//! in-memory [`nocturn_core::TessellationIndex`]; nothing ever writes it.

use crate::error::{RegistryError, RegistryResult};
use crate::models::SkyTileRow;
use nocturn_core::{SkyCoord, SkyTile, TessellationIndex};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Load the full sky-tile table and build the lookup index.
pub async fn load_sky_tiles(path: impl AsRef<Path>) -> RegistryResult<TessellationIndex> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(RegistryError::Config(format!(
            "tessellation database not found: {}",
            path.display()
        )));
    }

    let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=ro", path.display()))?
        .read_only(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;

    let rows = sqlx::query_as::<_, SkyTileRow>(
        "SELECT tile_id, ramin, ramax, decmin, decmax, cra, cdec, hp6, hp9 \
         FROM sky_tiles ORDER BY tile_id",
    )
    .fetch_all(&pool)
    .await?;

    pool.close().await;

    tracing::info!(tiles = rows.len(), "Loaded sky tessellation table");

    let tiles = rows
        .into_iter()
        .map(|r| {
            Ok(SkyTile {
                tile_id: r.tile_id,
                center: SkyCoord::new(r.cra, r.cdec)?,
                ramin: r.ramin,
                ramax: r.ramax,
                decmin: r.decmin,
                decmax: r.decmax,
                coarse_tag: r.hp6 as u64,
                fine_tag: r.hp9 as u64,
            })
        })
        .collect::<Result<Vec<_>, nocturn_core::Error>>()?;

    Ok(TessellationIndex::from_tiles(tiles)?)
}
