use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Derives `changed_columns()` for partial-update records.
///
/// Every `Option` field is treated as an editable column, the column name is the field name.
/// Fields that are `Some` are reported in declaration order, so the result can be used
/// both to build the `SET` clause and to bind values in the same order.
#[proc_macro_derive(ChangedColumns)]
pub fn changed_columns(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let struct_name = input.ident;

    let fields = if let syn::Data::Struct(syn::DataStruct {
                                              fields: syn::Fields::Named(ref fields),
                                              ..
                                          }) = input.data {
        fields
    } else {
        panic!("ChangedColumns supports structs with named fields only");
    };

    let optional_fields = fields.named.iter().filter_map(|field| {
        let field_name = field.ident.as_ref()?;
        let syn::Type::Path(type_path) = &field.ty else {
            return None;
        };
        if type_path.path.segments.last()?.ident == "Option" {
            Some(field_name.clone())
        } else {
            None
        }
    }).collect::<Vec<_>>();

    let checks = optional_fields.iter().map(|field_name| {
        quote! {
            if self.#field_name.is_some() {
                columns.push(stringify!(#field_name));
            }
        }
    });
    let empty_checks = optional_fields.iter().map(|field_name| {
        quote! { self.#field_name.is_none() }
    });

    let expanded = quote! {
        impl #struct_name {
            pub fn changed_columns(&self) -> Vec<&'static str> {
                let mut columns = Vec::new();
                #(#checks)*
                columns
            }
            pub fn is_empty_change(&self) -> bool {
                true #(&& #empty_checks)*
            }
        }
    };

    TokenStream::from(expanded)
}
