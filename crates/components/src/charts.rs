//! Components installed from their chart alone; no hooks, no providers.

use cairn_catalog::Context;
use cairn_core::Result;

const CHARTS: [(&str, &str, &str); 4] = [
    ("flux2", include_str!("../assets/flux2/config.yaml"), include_str!("../assets/flux2/hooks.yaml")),
    ("minio", include_str!("../assets/minio/config.yaml"), include_str!("../assets/minio/hooks.yaml")),
    ("sealed-secrets", include_str!("../assets/sealed-secrets/config.yaml"), include_str!("../assets/sealed-secrets/hooks.yaml")),
    ("vault", include_str!("../assets/vault/config.yaml"), include_str!("../assets/vault/hooks.yaml")),
];

pub fn initialize(ctx: &mut Context) -> Result<()> {
    for (name, config, hooks) in CHARTS {
        ctx.catalog.add_component(name, crate::descriptor(name, config, hooks, "")?);
    }
    Ok(())
}
