use std::collections::{BTreeMap, BTreeSet};

use common::error::AppError;
use serde::{Deserialize, Deserializer, Serialize};

/// Structured catalog proposal returned by the extraction service.
///
/// Nothing here is persisted on its own; the materializer turns it into
/// products, components and categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CatalogDraft {
    #[serde(default)]
    pub products: Vec<ExtractedProduct>,
    #[serde(default)]
    pub components: Vec<ExtractedComponent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedProduct {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub variations: Vec<ExtractedVariation>,
    #[serde(default)]
    pub steps: Vec<ExtractedStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedVariation {
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_prices")]
    pub prices: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedStep {
    pub name: String,
    #[serde(default)]
    pub min_selections: u32,
    #[serde(default)]
    pub max_selections: Option<u32>,
    #[serde(default)]
    pub options: Vec<ExtractedOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedOption {
    pub name: String,
    /// Name of the component this option consumes, if any.
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub price_delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedComponent {
    pub name: String,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub default_price: Option<f64>,
}

#[derive(Deserialize)]
struct ChannelPrice {
    channel: String,
    amount: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PriceList {
    Map(BTreeMap<String, f64>),
    Entries(Vec<ChannelPrice>),
}

/// Strict JSON schemas cannot express open maps, so the model answers with a
/// list of `{channel, amount}` entries. Both forms are accepted.
fn deserialize_prices<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<PriceList>::deserialize(deserializer)? {
        Some(PriceList::Map(map)) => map,
        Some(PriceList::Entries(entries)) => entries
            .into_iter()
            .map(|entry| (entry.channel, entry.amount))
            .collect(),
        None => BTreeMap::new(),
    })
}

fn clean(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_optional(value: Option<String>) -> Option<String> {
    value.map(|v| clean(&v)).filter(|v| !v.is_empty())
}

impl CatalogDraft {
    /// Collapses whitespace in every name and drops blank optional labels.
    pub fn normalized(self) -> Self {
        let products = self
            .products
            .into_iter()
            .map(|product| ExtractedProduct {
                name: clean(&product.name),
                description: clean_optional(product.description),
                category: clean_optional(product.category),
                variations: product
                    .variations
                    .into_iter()
                    .map(|variation| ExtractedVariation {
                        name: clean(&variation.name),
                        prices: variation
                            .prices
                            .into_iter()
                            .map(|(channel, price)| (clean(&channel), price))
                            .filter(|(channel, _)| !channel.is_empty())
                            .collect(),
                    })
                    .collect(),
                steps: product
                    .steps
                    .into_iter()
                    .map(|step| ExtractedStep {
                        name: clean(&step.name),
                        min_selections: step.min_selections,
                        max_selections: step.max_selections,
                        options: step
                            .options
                            .into_iter()
                            .map(|option| ExtractedOption {
                                name: clean(&option.name),
                                component: clean_optional(option.component),
                                price_delta: option.price_delta,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let components = self
            .components
            .into_iter()
            .map(|component| ExtractedComponent {
                name: clean(&component.name),
                aliases: component
                    .aliases
                    .iter()
                    .map(|alias| clean(alias))
                    .filter(|alias| !alias.is_empty())
                    .collect(),
                category: clean_optional(component.category),
                default_price: component.default_price,
            })
            .filter(|component| !component.name.is_empty())
            .collect();

        Self {
            products,
            components,
        }
    }

    /// A usable draft names at least one product and no product is blank.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.products.is_empty() {
            return Err(AppError::Validation(
                "the document did not yield any products".into(),
            ));
        }

        if let Some(position) = self
            .products
            .iter()
            .position(|product| product.name.trim().is_empty())
        {
            return Err(AppError::Validation(format!(
                "product at position {position} has no name"
            )));
        }

        Ok(())
    }

    /// Looks up a listed component by its exact (trimmed) name.
    pub fn component_named(&self, name: &str) -> Option<&ExtractedComponent> {
        let name = name.trim();
        self.components.iter().find(|c| c.name == name)
    }
}
