use std::collections::HashSet;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::{
    parse::Parse, spanned::Spanned, Data, DeriveInput, Fields, Ident, LitInt, LitStr, Token, Type,
};

pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

enum Role {
    Key,
    Version,
    Mapped { mutable: bool },
    Skip,
    Parent,
    HasMany {
        child_key: LitStr,
        order_by: Option<LitStr>,
    },
    BelongsTo {
        key: Ident,
    },
}

struct FieldSpec {
    ident: Ident,
    ty: Type,
    role: Role,
    storage: String,
    unique: bool,
    references: Option<String>,
    non_empty: bool,
    max_len: Option<usize>,
}

impl FieldSpec {
    fn is_mapped(&self) -> bool {
        matches!(self.role, Role::Key | Role::Version | Role::Mapped { .. })
    }

    fn is_input(&self) -> bool {
        matches!(self.role, Role::Mapped { .. })
    }
}

struct ModelSpec {
    collection: String,
    create: Ident,
    unique_together: Vec<(Vec<String>, Span)>,
    ignored: Vec<String>,
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "Model derive does not support generic structs",
        ));
    }

    let spec = parse_model_attrs(input)?;
    let fields = parse_fields(input)?;
    check_mapping(input, &spec, &fields)?;

    let name = &input.ident;
    let vis = &input.vis;
    let collection = &spec.collection;
    let create = &spec.create;

    let key = fields
        .iter()
        .find(|f| matches!(f.role, Role::Key))
        .ok_or_else(|| syn::Error::new(input.ident.span(), "Model derive: no field marked with #[model(key)]"))?;
    let key_ident = &key.ident;
    let key_ty = &key.ty;

    // Static schema entries
    let mapping_entries = fields.iter().filter(|f| f.is_mapped()).map(|f| {
        let attribute = f.ident.to_string();
        let storage = &f.storage;
        let access = match f.role {
            Role::Key => quote! { modeled_rust::Access::Key },
            Role::Version => quote! { modeled_rust::Access::Version },
            Role::Mapped { mutable: true } => quote! { modeled_rust::Access::Mutable },
            _ => quote! { modeled_rust::Access::Immutable },
        };
        let nullable = is_option(&f.ty);
        let unique = f.unique;
        let references = match &f.references {
            Some(r) => quote! { Some(#r) },
            None => quote! { None },
        };
        quote! {
            modeled_rust::FieldMapping {
                attribute: #attribute,
                field: #storage,
                access: #access,
                nullable: #nullable,
                unique: #unique,
                references: #references,
            }
        }
    });

    let unique_sets = spec.unique_together.iter().map(|(set, _)| {
        quote! { &[#(#set),*] }
    });
    let ignored = &spec.ignored;

    // Hydration
    let hydrate_fields = fields.iter().map(|f| {
        let ident = &f.ident;
        if f.is_mapped() {
            let storage = &f.storage;
            quote! {
                #ident: modeled_rust::__private::read_field(row, #collection, #storage)?
            }
        } else {
            quote! { #ident: ::core::default::Default::default() }
        }
    });

    // Write set: mutable attributes only
    let write_set = fields
        .iter()
        .filter(|f| matches!(f.role, Role::Mapped { mutable: true }))
        .map(|f| {
            let ident = &f.ident;
            let storage = &f.storage;
            quote! {
                row.insert(
                    #storage.to_string(),
                    modeled_rust::__private::write_field(#collection, #storage, &self.#ident)?,
                );
            }
        });

    let version_methods = match fields.iter().find(|f| matches!(f.role, Role::Version)) {
        Some(v) => {
            let ident = &v.ident;
            quote! {
                fn current_version(&self) -> Option<u64> {
                    Some(self.#ident)
                }

                fn set_current_version(&mut self, version: u64) {
                    self.#ident = version;
                }
            }
        }
        None => quote! {},
    };

    let parent_methods = match fields.iter().find(|f| matches!(f.role, Role::Parent)) {
        Some(p) => {
            let ident = &p.ident;
            quote! {
                fn parent_link(&self) -> Option<&modeled_rust::ParentLink> {
                    Some(&self.#ident)
                }

                fn set_parent_link(&mut self, link: modeled_rust::ParentLink) {
                    self.#ident = link;
                }
            }
        }
        None => quote! {},
    };

    let child_visits: Vec<_> = fields
        .iter()
        .filter(|f| matches!(f.role, Role::HasMany { .. }))
        .map(|f| {
            let ident = &f.ident;
            quote! { self.#ident.visit_loaded(visit)?; }
        })
        .collect();
    let visit_method = if child_visits.is_empty() {
        quote! {}
    } else {
        quote! {
            fn visit_children(
                &mut self,
                visit: &mut dyn FnMut(&mut dyn modeled_rust::GraphNode) -> Result<(), modeled_rust::DataError>,
            ) -> Result<(), modeled_rust::DataError> {
                #(#child_visits)*
                Ok(())
            }
        }
    };

    // Create input
    let input_fields: Vec<_> = fields.iter().filter(|f| f.is_input()).collect();
    let input_decls = input_fields.iter().map(|f| {
        let ident = &f.ident;
        let ty = &f.ty;
        quote! { pub #ident: #ty }
    });
    let input_checks = input_fields.iter().map(|f| shape_checks(f));
    // Save re-checks the attributes it writes
    let save_checks = fields
        .iter()
        .filter(|f| matches!(f.role, Role::Mapped { mutable: true }))
        .map(shape_checks);
    let input_row = input_fields.iter().map(|f| {
        let ident = &f.ident;
        let storage = &f.storage;
        quote! {
            row.insert(
                #storage.to_string(),
                modeled_rust::__private::write_field(#collection, #storage, &self.#ident)?,
            );
        }
    });
    let create_doc = format!("Create input for [`{}`]. Generated by `#[derive(Model)]`.", name);

    // Accessors
    let getters = fields
        .iter()
        .filter(|f| f.is_mapped() || matches!(f.role, Role::Skip))
        .map(|f| {
            let ident = &f.ident;
            let ty = &f.ty;
            quote! {
                pub fn #ident(&self) -> &#ty {
                    &self.#ident
                }
            }
        });

    let setters = fields
        .iter()
        .filter(|f| matches!(f.role, Role::Mapped { mutable: true } | Role::Skip))
        .map(|f| {
            let ident = &f.ident;
            let ty = &f.ty;
            let setter = format_ident!("set_{}", ident);
            let resets = fields.iter().filter_map(|rel| match &rel.role {
                Role::BelongsTo { key } if key == ident => {
                    let rel_ident = &rel.ident;
                    Some(quote! { self.#rel_ident.reset(); })
                }
                _ => None,
            });
            quote! {
                pub fn #setter(&mut self, value: #ty) {
                    self.#ident = value;
                    #(#resets)*
                }
            }
        });

    let relation_accessors = fields.iter().filter_map(|f| {
        let ident = &f.ident;
        let ty = &f.ty;
        match &f.role {
            Role::HasMany { child_key, order_by } => {
                let key_storage = &key.storage;
                let order_by = match order_by {
                    Some(o) => quote! { Some(#o) },
                    None => quote! { None },
                };
                Some(quote! {
                    pub fn #ident(
                        &mut self,
                        conn: &modeled_rust::Connection,
                    ) -> Result<
                        modeled_rust::Children<<#ty as modeled_rust::Relation>::Target>,
                        modeled_rust::DataError,
                    > {
                        let owner = modeled_rust::__private::write_field(#collection, #key_storage, &self.#key_ident)?;
                        self.#ident.load(conn, #child_key, owner, #order_by)
                    }
                })
            }
            Role::BelongsTo { key: fk } => {
                let fk_spec = fields.iter().find(|k| &k.ident == fk)?;
                let fk_storage = &fk_spec.storage;
                if is_option(&fk_spec.ty) {
                    Some(quote! {
                        pub fn #ident(
                            &mut self,
                            conn: &modeled_rust::Connection,
                        ) -> Result<
                            Option<&<#ty as modeled_rust::Relation>::Target>,
                            modeled_rust::DataError,
                        > {
                            let key = match &self.#fk {
                                Some(value) => Some(modeled_rust::__private::write_field(#collection, #fk_storage, value)?),
                                None => None,
                            };
                            self.#ident.load(conn, key)
                        }
                    })
                } else {
                    Some(quote! {
                        pub fn #ident(
                            &mut self,
                            conn: &modeled_rust::Connection,
                        ) -> Result<&<#ty as modeled_rust::Relation>::Target, modeled_rust::DataError> {
                            let key = modeled_rust::__private::write_field(#collection, #fk_storage, &self.#fk)?;
                            self.#ident.load_required(conn, key)
                        }
                    })
                }
            }
            _ => None,
        }
    });

    Ok(quote! {
        impl modeled_rust::Model for #name {
            type Key = #key_ty;
            type New = #create;

            fn schema() -> &'static modeled_rust::ModelSchema {
                static SCHEMA: modeled_rust::ModelSchema = modeled_rust::ModelSchema {
                    collection: #collection,
                    fields: &[#(#mapping_entries),*],
                    unique_together: &[#(#unique_sets),*],
                    ignored_fields: &[#(#ignored),*],
                };
                &SCHEMA
            }

            fn key(&self) -> &Self::Key {
                &self.#key_ident
            }

            fn hydrate(
                row: &modeled_rust::Row,
                _token: modeled_rust::Hydration,
            ) -> Result<Self, modeled_rust::DataError> {
                Ok(Self {
                    #(#hydrate_fields),*
                })
            }

            fn write_set(&self) -> Result<modeled_rust::Row, modeled_rust::DataError> {
                #[allow(unused_mut)]
                let mut row = modeled_rust::Row::new();
                #(#write_set)*
                Ok(row)
            }

            fn validate(&self) -> Result<(), modeled_rust::ValidationErrors> {
                #[allow(unused_mut)]
                let mut errors = modeled_rust::ValidationErrors::new();
                #(#save_checks)*
                errors.into_result()
            }

            #version_methods
            #parent_methods
            #visit_method
        }

        #[doc = #create_doc]
        #[derive(Debug, Clone)]
        #vis struct #create {
            #(#input_decls),*
        }

        impl modeled_rust::CreateInput for #create {
            fn validate(&self) -> Result<(), modeled_rust::ValidationErrors> {
                #[allow(unused_mut)]
                let mut errors = modeled_rust::ValidationErrors::new();
                #(#input_checks)*
                errors.into_result()
            }

            fn into_row(self) -> Result<modeled_rust::Row, modeled_rust::DataError> {
                #[allow(unused_mut)]
                let mut row = modeled_rust::Row::new();
                #(#input_row)*
                Ok(row)
            }
        }

        #[allow(dead_code)]
        impl #name {
            #(#getters)*
            #(#setters)*
            #(#relation_accessors)*
        }
    })
}

fn shape_checks(f: &FieldSpec) -> TokenStream2 {
    let ident = &f.ident;
    let attribute = f.ident.to_string();
    let non_empty = if f.non_empty {
        quote! { modeled_rust::__private::check_non_empty(&mut errors, #attribute, &self.#ident); }
    } else {
        quote! {}
    };
    let max_len = match f.max_len {
        Some(max) => quote! {
            modeled_rust::__private::check_max_len(&mut errors, #attribute, &self.#ident, #max);
        },
        None => quote! {},
    };
    quote! { #non_empty #max_len }
}

fn parse_model_attrs(input: &DeriveInput) -> syn::Result<ModelSpec> {
    let mut collection = None;
    let mut create = None;
    let mut unique_together = Vec::new();
    let mut ignored = Vec::new();

    for attr in &input.attrs {
        if !attr.path().is_ident("model") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("collection") {
                let value: LitStr = meta.value()?.parse()?;
                collection = Some(value.value());
            } else if meta.path.is_ident("create") {
                let value: LitStr = meta.value()?.parse()?;
                create = Some(Ident::new(&value.value(), value.span()));
            } else if meta.path.is_ident("unique_together") {
                let span = meta.path.span();
                unique_together.push((parse_str_list(&meta)?, span));
            } else if meta.path.is_ident("ignore_fields") {
                ignored.extend(parse_str_list(&meta)?);
            } else {
                return Err(meta.error("unsupported #[model] struct attribute"));
            }
            Ok(())
        })?;
    }

    let name = input.ident.to_string();
    Ok(ModelSpec {
        // Default: snake_case struct name + "s"
        collection: collection.unwrap_or_else(|| format!("{}s", to_snake_case(&name))),
        create: create.unwrap_or_else(|| format_ident!("New{}", input.ident)),
        unique_together,
        ignored,
    })
}

fn parse_str_list(meta: &syn::meta::ParseNestedMeta) -> syn::Result<Vec<String>> {
    let content;
    syn::parenthesized!(content in meta.input);
    let values = content.parse_terminated(<LitStr as Parse>::parse, Token![,])?;
    Ok(values.into_iter().map(|v| v.value()).collect())
}

fn parse_fields(input: &DeriveInput) -> syn::Result<Vec<FieldSpec>> {
    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(
            input.ident.span(),
            "Model derive only supports structs",
        ));
    };
    let Fields::Named(named) = &data.fields else {
        return Err(syn::Error::new(
            input.ident.span(),
            "Model derive requires named fields",
        ));
    };

    let mut specs = Vec::with_capacity(named.named.len());
    for field in &named.named {
        let Some(ident) = field.ident.clone() else {
            continue;
        };

        let mut key = false;
        let mut version = false;
        let mut mutable = false;
        let mut skip = false;
        let mut parent = false;
        let mut unique = false;
        let mut non_empty = false;
        let mut storage = None;
        let mut references = None;
        let mut max_len = None;
        let mut has_many = None;
        let mut belongs_to = None;

        for attr in &field.attrs {
            if !attr.path().is_ident("model") {
                continue;
            }
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("key") {
                    key = true;
                } else if meta.path.is_ident("version") {
                    version = true;
                } else if meta.path.is_ident("mutable") {
                    mutable = true;
                } else if meta.path.is_ident("skip") {
                    skip = true;
                } else if meta.path.is_ident("parent") {
                    parent = true;
                } else if meta.path.is_ident("unique") {
                    unique = true;
                } else if meta.path.is_ident("non_empty") {
                    non_empty = true;
                } else if meta.path.is_ident("field") {
                    let value: LitStr = meta.value()?.parse()?;
                    storage = Some(value.value());
                } else if meta.path.is_ident("references") {
                    let value: LitStr = meta.value()?.parse()?;
                    references = Some(value.value());
                } else if meta.path.is_ident("max_len") {
                    let value: LitInt = meta.value()?.parse()?;
                    max_len = Some(value.base10_parse::<usize>()?);
                } else if meta.path.is_ident("has_many") {
                    let mut child_key = None;
                    let mut order_by = None;
                    meta.parse_nested_meta(|inner| {
                        if inner.path.is_ident("child_key") {
                            child_key = Some(inner.value()?.parse::<LitStr>()?);
                        } else if inner.path.is_ident("order_by") {
                            order_by = Some(inner.value()?.parse::<LitStr>()?);
                        } else {
                            return Err(inner.error("expected `child_key` or `order_by`"));
                        }
                        Ok(())
                    })?;
                    let child_key = child_key
                        .ok_or_else(|| meta.error("has_many requires `child_key = \"...\"`"))?;
                    has_many = Some(Role::HasMany { child_key, order_by });
                } else if meta.path.is_ident("belongs_to") {
                    let mut fk = None;
                    meta.parse_nested_meta(|inner| {
                        if inner.path.is_ident("key") {
                            let value: LitStr = inner.value()?.parse()?;
                            fk = Some(Ident::new(&value.value(), value.span()));
                            Ok(())
                        } else {
                            Err(inner.error("expected `key`"))
                        }
                    })?;
                    let key = fk.ok_or_else(|| meta.error("belongs_to requires `key = \"...\"`"))?;
                    belongs_to = Some(Role::BelongsTo { key });
                } else {
                    return Err(meta.error("unsupported #[model] field attribute"));
                }
                Ok(())
            })?;
        }

        let markers = [key, version, skip, parent, has_many.is_some(), belongs_to.is_some()]
            .iter()
            .filter(|m| **m)
            .count();
        if markers > 1 {
            return Err(syn::Error::new(
                ident.span(),
                "a field can only be one of key, version, skip, parent, has_many, belongs_to",
            ));
        }
        if mutable && markers > 0 && !skip {
            return Err(syn::Error::new(
                ident.span(),
                "only plain attributes can be marked mutable",
            ));
        }

        let role = if key {
            Role::Key
        } else if version {
            Role::Version
        } else if skip {
            Role::Skip
        } else if parent {
            Role::Parent
        } else if let Some(rel) = has_many {
            rel
        } else if let Some(rel) = belongs_to {
            rel
        } else {
            Role::Mapped { mutable }
        };

        specs.push(FieldSpec {
            storage: storage.unwrap_or_else(|| ident.to_string()),
            ident,
            ty: field.ty.clone(),
            role,
            unique,
            references,
            non_empty,
            max_len,
        });
    }

    Ok(specs)
}

/// Compile-time mapping checks: each storage field maps to one attribute and
/// each attribute to one storage field.
fn check_mapping(input: &DeriveInput, spec: &ModelSpec, fields: &[FieldSpec]) -> syn::Result<()> {
    let keys = fields.iter().filter(|f| matches!(f.role, Role::Key)).count();
    if keys != 1 {
        return Err(syn::Error::new(
            input.ident.span(),
            "Model derive requires exactly one #[model(key)] field",
        ));
    }
    if fields.iter().filter(|f| matches!(f.role, Role::Version)).count() > 1 {
        return Err(syn::Error::new(
            input.ident.span(),
            "Model derive allows at most one #[model(version)] field",
        ));
    }
    if fields.iter().filter(|f| matches!(f.role, Role::Parent)).count() > 1 {
        return Err(syn::Error::new(
            input.ident.span(),
            "Model derive allows at most one #[model(parent)] field",
        ));
    }

    let mut storage_names = HashSet::new();
    for field in fields.iter().filter(|f| f.is_mapped()) {
        if !storage_names.insert(field.storage.clone()) {
            return Err(syn::Error::new(
                field.ident.span(),
                format!("storage field `{}` is mapped by more than one attribute", field.storage),
            ));
        }
    }

    for ignored in &spec.ignored {
        if storage_names.contains(ignored) {
            return Err(syn::Error::new(
                input.ident.span(),
                format!("ignored storage field `{}` is also mapped", ignored),
            ));
        }
    }

    let attributes: HashSet<String> = fields
        .iter()
        .filter(|f| f.is_mapped())
        .map(|f| f.ident.to_string())
        .collect();
    for (set, span) in &spec.unique_together {
        for attribute in set {
            if !attributes.contains(attribute) {
                return Err(syn::Error::new(
                    *span,
                    format!("unique_together names unknown attribute `{}`", attribute),
                ));
            }
        }
    }

    for field in fields {
        if let Role::BelongsTo { key } = &field.role {
            let target = fields.iter().find(|f| &f.ident == key);
            if !matches!(target.map(|t| &t.role), Some(Role::Mapped { .. })) {
                return Err(syn::Error::new(
                    key.span(),
                    format!("belongs_to key `{}` must be a mapped attribute", key),
                ));
            }
        }
    }

    Ok(())
}

fn is_option(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => {
            path.qself.is_none()
                && path
                    .path
                    .segments
                    .last()
                    .map(|segment| segment.ident == "Option")
                    .unwrap_or(false)
        }
        _ => false,
    }
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, ch) in s.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(ch.to_lowercase());
        } else {
            result.push(ch);
        }
    }
    result
}
