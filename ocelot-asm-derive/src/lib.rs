//! Internal implementation details of `ocelot-asm`.
//!
//! Do not use this crate directly!

extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse::Error, parse_macro_input, DeriveInput, Result};

#[proc_macro_derive(Opcode, attributes(opcode))]
pub fn opcode(input: TokenStream) -> TokenStream {
    // Parse input into a syntax tree.
    let ast = parse_macro_input!(input as DeriveInput);

    // Build the impl.
    match impl_opcode(&ast) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn impl_opcode(ast: &DeriveInput) -> Result<proc_macro2::TokenStream> {
    if let syn::Data::Enum(data) = &ast.data {
        let name = &ast.ident;

        // Collect (mnemonic, kind, variant) triples for all variants except
        // the reserved `Bad` variant, which marks un-decodable instructions.
        let mut entries = Vec::new();
        for variant in data
            .variants
            .iter()
            .filter(|v| v.ident != syn::Ident::new("Bad", Span::call_site()))
        {
            let (mnemonic, kind) = extract_opcode_attributes(variant)?;
            entries.push((mnemonic, kind, variant.ident.clone()));
        }

        if entries.is_empty() {
            return Err(Error::new(
                Span::call_site(),
                "#[derive(Opcode)] needs at least one #[opcode] variant",
            ));
        }

        // The lookup table is sorted lexicographically by mnemonic so that
        // `from_mnemonic` can perform a binary search over it. Opcode
        // identifiers are indices into this sorted table.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in entries.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(Error::new(
                    Span::call_site(),
                    format!("duplicate mnemonic \"{}\"", pair[0].0),
                ));
            }
        }

        let count = entries.len();
        let mnemonics: Vec<&String> = entries.iter().map(|e| &e.0).collect();
        let mut mnemonic_arms = Vec::new();
        let mut kind_arms = Vec::new();
        let mut id_arms = Vec::new();
        let mut from_id_arms = Vec::new();

        for (id, (mnemonic, kind, vname)) in entries.iter().enumerate() {
            let id = id as u16;
            let kind = syn::Ident::new(kind, Span::call_site());

            mnemonic_arms.push(quote! {
                #name::#vname => #mnemonic
            });

            kind_arms.push(quote! {
                #name::#vname => OpcodeKind::#kind
            });

            id_arms.push(quote! {
                #name::#vname => #id
            });

            from_id_arms.push(quote! {
                #id => #name::#vname
            });
        }

        Ok(quote! {
            impl #name {
                /// The number of valid opcodes in the lookup table.
                pub const COUNT: usize = #count;

                /// The mnemonic table, sorted lexicographically.
                pub const MNEMONICS: [&'static str; #count] = [#(#mnemonics),*];

                /// Whether the opcode marks an un-decodable instruction.
                pub fn is_bad(&self) -> bool {
                    match self {
                        #name::Bad => true,
                        _ => false,
                    }
                }

                /// Gets the mnemonic of the opcode.
                pub fn mnemonic(&self) -> &'static str {
                    match self {
                        #(#mnemonic_arms),*,
                        #name::Bad => "(bad)",
                    }
                }

                /// Gets the kind of operation the opcode performs.
                pub fn kind(&self) -> OpcodeKind {
                    match self {
                        #(#kind_arms),*,
                        #name::Bad => OpcodeKind::Bad,
                    }
                }

                /// Gets the identifier of the opcode, its index in the sorted
                /// mnemonic table.
                pub fn id(&self) -> u16 {
                    match self {
                        #(#id_arms),*,
                        #name::Bad => u16::max_value(),
                    }
                }

                /// Looks an opcode up from its identifier.
                ///
                /// Out-of-range identifiers yield the `Bad` opcode.
                pub fn from_id(id: u16) -> Self {
                    match id {
                        #(#from_id_arms),*,
                        _ => #name::Bad,
                    }
                }

                /// Looks an opcode up from its mnemonic through a binary
                /// search over the sorted mnemonic table.
                pub fn from_mnemonic(mnemonic: &str) -> Option<Self> {
                    Self::MNEMONICS
                        .binary_search_by(|probe| (*probe).cmp(mnemonic))
                        .ok()
                        .map(|id| Self::from_id(id as u16))
                }
            }
        })
    } else {
        Err(Error::new(
            Span::call_site(),
            "#[derive(Opcode)] can only be applied to enums",
        ))
    }
}

fn extract_opcode_attributes(variant: &syn::Variant) -> Result<(String, String)> {
    if let Some(attr) = variant
        .attrs
        .iter()
        .find(|a| a.path.segments.len() == 1 && a.path.segments[0].ident == "opcode")
    {
        if let syn::Meta::List(ref nested_list) = attr.parse_meta()? {
            let mut arguments = Vec::new();

            for nested_meta in nested_list.nested.iter() {
                if let syn::NestedMeta::Meta(syn::Meta::NameValue(ref value)) = nested_meta {
                    arguments.push(value);
                } else {
                    return Err(Error::new(
                        attr.path.segments[0].ident.span(),
                        "#[opcode] is expecting its arguments in name=value format",
                    ));
                }
            }

            if arguments.len() != 2 {
                return Err(Error::new(
                    attr.path.segments[0].ident.span(),
                    "#[opcode] takes a `mnemonic = \"...\"` and a `kind = \"...\"` argument",
                ));
            }

            let mnemonic = string_value(arguments[0], "mnemonic")?;
            let kind = string_value(arguments[1], "kind")?;
            Ok((mnemonic, kind))
        } else {
            Err(Error::new(
                attr.path.segments[0].ident.span(),
                "#[opcode] is expecting arguments in list-style",
            ))
        }
    } else {
        Err(Error::new(
            Span::call_site(),
            "#[opcode] attribute is missing",
        ))
    }
}

/// Pulls the string out of a `name = "value"` pair, checking it sits in
/// the slot the attribute grammar expects (`mnemonic` first, `kind`
/// second).
fn string_value(meta: &syn::MetaNameValue, expected: &str) -> Result<String> {
    if !meta.path.is_ident(expected) {
        return Err(Error::new_spanned(
            &meta.path,
            format!("#[opcode] expects `{} = \"...\"` in this position", expected),
        ));
    }
    match &meta.lit {
        syn::Lit::Str(lit) => Ok(lit.value()),
        other => Err(Error::new_spanned(
            other,
            format!("the `{}` argument must be a string literal", expected),
        )),
    }
}
