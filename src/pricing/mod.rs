use crate::db::settings::SettingsStore;

/// Per-1M-token USD price for a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

/// Per-provider cache-token rate multipliers, applied to the input rate
/// (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheMultipliers {
    pub create: f64,
    pub read: f64,
}

impl Default for CacheMultipliers {
    fn default() -> Self {
        Self { create: 1.0, read: 0.5 }
    }
}

/// Fixed known-model seed. The exact model set is catalog data, not semantically
/// significant (`spec.md` §4.3).
const DEFAULT_PRICING: &[(&str, ModelPrice)] = &[
    ("claude-opus-4", ModelPrice { input: 15.0, output: 75.0 }),
    ("claude-sonnet-4", ModelPrice { input: 3.0, output: 15.0 }),
    ("claude-haiku-4", ModelPrice { input: 0.8, output: 4.0 }),
    ("gpt-5", ModelPrice { input: 5.0, output: 15.0 }),
    ("gpt-5-mini", ModelPrice { input: 0.25, output: 2.0 }),
    ("gemini-2.5-flash", ModelPrice { input: 0.3, output: 2.5 }),
];

fn catalog_price(model: &str) -> Option<ModelPrice> {
    DEFAULT_PRICING
        .iter()
        .find(|(id, _)| *id == model)
        .map(|(_, p)| *p)
}

fn default_cache_multipliers(provider: &str) -> CacheMultipliers {
    match provider {
        "anthropic" => CacheMultipliers { create: 1.25, read: 0.10 },
        "openai" => CacheMultipliers { create: 0.0, read: 0.5 },
        "google" => CacheMultipliers { create: 0.0, read: 0.25 },
        _ => CacheMultipliers::default(),
    }
}

/// Splits a `pricing.<model>.<input|output>` settings key on the **last** dot,
/// since model ids may themselves contain dots (e.g. `gpt-5.2`) (`spec.md` §4.3).
pub fn parse_pricing_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix("pricing.")?;
    let (model, field) = rest.rsplit_once('.')?;
    if model.is_empty() || field.is_empty() {
        return None;
    }
    Some((model.to_string(), field.to_string()))
}

pub struct PricingEngine<'a> {
    settings: SettingsStore<'a>,
}

impl<'a> PricingEngine<'a> {
    pub fn new(settings: SettingsStore<'a>) -> Self {
        Self { settings }
    }

    /// Lookup priority: DB override > catalog default > `None` (unknown model,
    /// uncosted — `spec.md` §4.3, §8 boundary behavior).
    pub async fn model_pricing(&self, model: &str) -> Option<ModelPrice> {
        let input = self
            .settings
            .get_raw(&format!("pricing.{model}.input"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<f64>().ok());
        let output = self
            .settings
            .get_raw(&format!("pricing.{model}.output"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<f64>().ok());

        match (input, output) {
            (Some(i), Some(o)) => Some(ModelPrice { input: i, output: o }),
            (Some(i), None) => catalog_price(model).map(|p| ModelPrice { input: i, output: p.output }),
            (None, Some(o)) => catalog_price(model).map(|p| ModelPrice { input: p.input, output: o }),
            (None, None) => catalog_price(model),
        }
    }

    pub async fn upsert_pricing(&self, model: &str, input: f64, output: f64) -> anyhow::Result<()> {
        self.settings
            .set_raw(&format!("pricing.{model}.input"), &input.to_string())
            .await?;
        self.settings
            .set_raw(&format!("pricing.{model}.output"), &output.to_string())
            .await?;
        Ok(())
    }

    pub async fn delete_pricing_override(&self, model: &str) -> anyhow::Result<()> {
        self.settings.delete(&format!("pricing.{model}.input")).await?;
        self.settings.delete(&format!("pricing.{model}.output")).await?;
        Ok(())
    }

    pub async fn cache_multipliers(&self, provider: &str) -> CacheMultipliers {
        let defaults = default_cache_multipliers(provider);
        let create = self
            .settings
            .get_raw(&format!("cache.{provider}.create"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(defaults.create);
        let read = self
            .settings
            .get_raw(&format!("cache.{provider}.read"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(defaults.read);
        CacheMultipliers { create, read }
    }

    pub async fn upsert_cache_multipliers(
        &self,
        provider: &str,
        create: f64,
        read: f64,
    ) -> anyhow::Result<()> {
        self.settings
            .set_raw(&format!("cache.{provider}.create"), &create.to_string())
            .await?;
        self.settings
            .set_raw(&format!("cache.{provider}.read"), &read.to_string())
            .await?;
        Ok(())
    }

    pub async fn delete_cache_multiplier_override(&self, provider: &str) -> anyhow::Result<()> {
        self.settings.delete(&format!("cache.{provider}.create")).await?;
        self.settings.delete(&format!("cache.{provider}.read")).await?;
        Ok(())
    }

    /// `cost = (input·P.in + output·P.out + cacheCreate·P.in·M.create +
    /// cacheRead·P.in·M.read) / 1_000_000` (`spec.md` §4.3). Unknown model with no
    /// override costs `0.0`; the caller still records the usage.
    pub async fn cost_of(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cache_create: u64,
        cache_read: u64,
    ) -> f64 {
        let Some(price) = self.model_pricing(model).await else {
            return 0.0;
        };
        let mult = self.cache_multipliers(provider).await;
        (input_tokens as f64 * price.input
            + output_tokens as f64 * price.output
            + cache_create as f64 * price.input * mult.create
            + cache_read as f64 * price.input * mult.read)
            / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn pricing_key_splits_on_last_dot() {
        assert_eq!(
            parse_pricing_key("pricing.gpt-5.2.input"),
            Some(("gpt-5.2".to_string(), "input".to_string()))
        );
        assert_eq!(
            parse_pricing_key("pricing.claude-opus-4.output"),
            Some(("claude-opus-4".to_string(), "output".to_string()))
        );
        assert_eq!(parse_pricing_key("pipeline.maxRetries"), None);
    }

    #[tokio::test]
    async fn dedup_cost_anthropic_scenario() {
        let db = Db::connect_memory().await.unwrap();
        let settings = SettingsStore::new(&db);
        let engine = PricingEngine::new(settings);
        engine.upsert_pricing("claude-opus-4", 5.0, 25.0).await.unwrap();
        // raw input 5000 minus cache tokens 1000+2000 = 2000, per the orchestrator's
        // dedup rule (spec.md §4.1 step 3).
        let cost = engine
            .cost_of("anthropic", "claude-opus-4", 2000, 500, 1000, 2000)
            .await;
        assert!((cost - 0.02975).abs() < 1e-9, "cost was {cost}");
    }

    #[tokio::test]
    async fn absence_of_cache_args_equals_zero_cache_args() {
        let db = Db::connect_memory().await.unwrap();
        let settings = SettingsStore::new(&db);
        let engine = PricingEngine::new(settings);
        engine.upsert_pricing("claude-opus-4", 5.0, 25.0).await.unwrap();
        let a = engine.cost_of("anthropic", "claude-opus-4", 100, 50, 0, 0).await;
        let b = engine.cost_of("anthropic", "claude-opus-4", 100, 50, 0, 0).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn unknown_model_costs_zero() {
        let db = Db::connect_memory().await.unwrap();
        let settings = SettingsStore::new(&db);
        let engine = PricingEngine::new(settings);
        let cost = engine.cost_of("anthropic", "no-such-model", 100, 50, 0, 0).await;
        assert_eq!(cost, 0.0);
    }

    #[tokio::test]
    async fn pricing_override_round_trips() {
        let db = Db::connect_memory().await.unwrap();
        let settings = SettingsStore::new(&db);
        let engine = PricingEngine::new(settings);
        engine.upsert_pricing("claude-opus-4", 1.0, 2.0).await.unwrap();
        assert_eq!(
            engine.model_pricing("claude-opus-4").await,
            Some(ModelPrice { input: 1.0, output: 2.0 })
        );
        engine.delete_pricing_override("claude-opus-4").await.unwrap();
        assert_eq!(
            engine.model_pricing("claude-opus-4").await,
            catalog_price("claude-opus-4")
        );
    }

    #[tokio::test]
    async fn cache_multiplier_round_trips() {
        let db = Db::connect_memory().await.unwrap();
        let settings = SettingsStore::new(&db);
        let engine = PricingEngine::new(settings);
        engine.upsert_cache_multipliers("openai", 0.5, 0.25).await.unwrap();
        assert_eq!(
            engine.cache_multipliers("openai").await,
            CacheMultipliers { create: 0.5, read: 0.25 }
        );
        engine.delete_cache_multiplier_override("openai").await.unwrap();
        assert_eq!(
            engine.cache_multipliers("openai").await,
            default_cache_multipliers("openai")
        );
    }
}
