use serde_json::json;

pub static CATALOG_DRAFT_SYSTEM_MESSAGE: &str = r#"You turn a store's menu, price list or product sheet into a structured catalog draft.

Rules:
- Emit one product per sellable item. Keep the item's name as printed; do not invent items.
- `category` is the section heading the item appears under, or null.
- Sizes or formats of the same item are `variations`; give each variation its prices per sales channel
  (use "default" when the document shows a single price, or channel names such as "in_store", "delivery", "takeaway").
- Choices a customer makes while ordering (base, protein, toppings, extras) are `steps`. Set `min_selections`
  and `max_selections` when the document states them, otherwise 0 and null.
- A step option that consumes an ingredient names it in `component`; list each ingredient once in `components`
  with any alternative spellings as `aliases`.
- Prices are plain numbers in the document's currency. Use null when a price is not stated.
- If the document contains no products, return empty arrays."#;

pub fn get_catalog_draft_schema() -> serde_json::Value {
    let nullable_string = json!({ "type": ["string", "null"] });
    let nullable_number = json!({ "type": ["number", "null"] });

    json!({
        "type": "object",
        "properties": {
            "products": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "description": nullable_string,
                        "category": nullable_string,
                        "variations": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": { "type": "string" },
                                    "prices": {
                                        "type": "array",
                                        "items": {
                                            "type": "object",
                                            "properties": {
                                                "channel": { "type": "string" },
                                                "amount": { "type": "number" }
                                            },
                                            "required": ["channel", "amount"],
                                            "additionalProperties": false
                                        }
                                    }
                                },
                                "required": ["name", "prices"],
                                "additionalProperties": false
                            }
                        },
                        "steps": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "name": { "type": "string" },
                                    "min_selections": { "type": "integer" },
                                    "max_selections": { "type": ["integer", "null"] },
                                    "options": {
                                        "type": "array",
                                        "items": {
                                            "type": "object",
                                            "properties": {
                                                "name": { "type": "string" },
                                                "component": nullable_string,
                                                "price_delta": nullable_number
                                            },
                                            "required": ["name", "component", "price_delta"],
                                            "additionalProperties": false
                                        }
                                    }
                                },
                                "required": ["name", "min_selections", "max_selections", "options"],
                                "additionalProperties": false
                            }
                        }
                    },
                    "required": ["name", "description", "category", "variations", "steps"],
                    "additionalProperties": false
                }
            },
            "components": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "aliases": { "type": "array", "items": { "type": "string" } },
                        "category": nullable_string,
                        "default_price": nullable_number
                    },
                    "required": ["name", "aliases", "category", "default_price"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["products", "components"],
        "additionalProperties": false
    })
}
